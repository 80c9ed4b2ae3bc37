//! Image verification policies and the resource-side half of evaluation.
//!
//! `imprimatur-policy` defines the `ImageVerificationPolicy` document model,
//! loads and validates policies, and implements the pieces of evaluation
//! that only look at the resource under test:
//!
//! 1. **Matching**: `all`/`any` field-equality predicates gate each rule
//! 2. **Extraction**: wildcard path rules locate image references
//! 3. **References**: image strings are parsed into registry/path/tag/digest
//!
//! Signature and attestation checks live in `imprimatur-verify`.

pub mod condition;
pub mod error;
pub mod expression;
pub mod extract;
pub mod glob;
pub mod image;
pub mod loader;
pub mod matching;
pub mod policy;

// Re-export primary types for convenience.
pub use error::PolicyError;
pub use extract::{ExtractedImages, extract_images};
pub use image::ImageInfo;
pub use matching::{Mismatch, matches};
pub use policy::{ImageVerificationPolicy, Rule, VerificationRule};
