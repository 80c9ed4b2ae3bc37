//! Image verification engine for `imprimatur` policies.
//!
//! `imprimatur-verify` applies [`ImageVerificationPolicy`] documents to a
//! resource and reports, per rule and per image, whether the image's
//! signatures, attestations and external checks satisfy the policy.
//!
//! The pipeline for each rule:
//! 1. **Match**: the rule's `match` block is checked against the resource
//! 2. **Extract**: image references are pulled out of the resource
//! 3. **Context**: `images` and the rule's context entries are bound
//! 4. **Substitute**: `{{ ... }}` templates in the verify entries resolve
//! 5. **Verify**: each image runs through the sub-verifications and a quorum
//!
//! Signature checks and API calls go through the [`ImageVerifier`] and
//! [`ApiCaller`] traits. [`SignatureStore`] and [`HttpApiCaller`] are the
//! bundled implementations.
//!
//! [`ImageVerificationPolicy`]: imprimatur_policy::ImageVerificationPolicy

pub mod api_call;
pub mod capability;
pub mod conditions;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod pem;
pub mod report;
pub mod signature;
pub mod store;
pub mod substitute;
pub mod verify;

// Re-export primary types for convenience.
pub use api_call::HttpApiCaller;
pub use capability::{ApiCaller, ImageVerifier};
pub use config::EngineConfig;
pub use context::Context;
pub use engine::{EngineResponse, PolicyEngine};
pub use error::VerificationError;
pub use store::SignatureStore;
pub use verify::{Capabilities, VerificationOutcome, VerificationResult, Verifier};
