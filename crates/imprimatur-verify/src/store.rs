//! Offline signature store.
//!
//! A JSON file mapping image references to cosign-style signatures and DSSE
//! attestation envelopes. It implements [`ImageVerifier`] without registry
//! or transparency-log access, which makes policies testable end to end.
//!
//! ```json
//! {
//!   "images": {
//!     "ghcr.io/org/app:v1": {
//!       "signatures": [{ "payload": "<base64>", "signature": "<base64>" }],
//!       "attestations": [{ "payloadType": "application/vnd.in-toto+json",
//!                          "payload": "<base64>", "signatures": [{ "sig": "<base64>" }] }]
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use imprimatur_policy::glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::capability::{Authority, CapabilityError, ImageVerifier, Statement, VerifyOptions};
use crate::error::VerificationError;
use crate::signature;

/// Signatures and attestations for a set of images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureStore {
    /// Entries keyed by image reference.
    #[serde(default)]
    pub images: BTreeMap<String, ImageEntry>,
}

/// Everything stored for one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Simple-signing signatures.
    #[serde(default)]
    pub signatures: Vec<StoredSignature>,
    /// DSSE attestation envelopes.
    #[serde(default)]
    pub attestations: Vec<DsseEnvelope>,
}

/// A signature over a simple-signing payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignature {
    /// Base64 simple-signing JSON.
    pub payload: String,
    /// Base64 signature over the decoded payload.
    pub signature: String,
    /// PEM signing certificate, for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

/// A DSSE envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DsseEnvelope {
    /// Base64 in-toto statement.
    pub payload: String,
    /// Payload media type.
    pub payload_type: String,
    /// Signatures over the pre-authentication encoding.
    pub signatures: Vec<DsseSignature>,
}

/// One DSSE signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsseSignature {
    /// Base64 signature.
    pub sig: String,
    /// PEM signing certificate, for keyless signatures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

/// DSSE pre-authentication encoding.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "DSSEv1 {} {payload_type} {} ",
        payload_type.len(),
        payload.len()
    )
    .into_bytes();
    out.extend_from_slice(payload);
    out
}

fn decode(b64: &str, what: &str) -> Result<Vec<u8>, CapabilityError> {
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| CapabilityError::Verification(format!("invalid base64 {what}: {e}")))
}

impl SignatureStore {
    /// Load a store from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, VerificationError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn entry(&self, options: &VerifyOptions) -> Option<&ImageEntry> {
        self.images
            .get(&options.image)
            .or_else(|| self.images.get(&options.info.reference_with_tag()))
    }

    /// Check one signature against the authority.
    fn check(
        authority: &Authority,
        payload: &[u8],
        sig_b64: &str,
        certificate: Option<&str>,
    ) -> Result<(), CapabilityError> {
        match authority {
            Authority::Key { public_key } => {
                signature::verify_with_key(payload, sig_b64, public_key)
                    .map_err(|e| CapabilityError::Verification(e.to_string()))
            }
            Authority::Certificate { cert, .. } => {
                let cert = signature::parse_certificate(cert).map_err(|e| {
                    CapabilityError::Operational(format!("configured certificate: {e}"))
                })?;
                signature::verify_with_certificate(payload, sig_b64, &cert)
                    .map_err(|e| CapabilityError::Verification(e.to_string()))
            }
            Authority::Keyless { issuer, subject, .. } => {
                let pem = certificate.ok_or_else(|| {
                    CapabilityError::Verification("keyless signature has no certificate".to_owned())
                })?;
                let cert = signature::parse_certificate(pem)
                    .map_err(|e| CapabilityError::Verification(e.to_string()))?;
                signature::verify_with_certificate(payload, sig_b64, &cert)
                    .map_err(|e| CapabilityError::Verification(e.to_string()))?;
                let identity = signature::certificate_identity(&cert)
                    .map_err(|e| CapabilityError::Verification(e.to_string()))?;
                if !subject.is_empty()
                    && !identity.subjects.iter().any(|s| glob::matches(subject, s))
                {
                    return Err(CapabilityError::Verification(format!(
                        "subject mismatch: expected {subject}, found {:?}",
                        identity.subjects
                    )));
                }
                if !issuer.is_empty() && identity.issuer.as_deref() != Some(issuer.as_str()) {
                    return Err(CapabilityError::Verification(format!(
                        "issuer mismatch: expected {issuer}, found {}",
                        identity.issuer.as_deref().unwrap_or("none")
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Check the simple-signing claims against the image.
fn check_payload(payload: &[u8], options: &VerifyOptions) -> Result<(), CapabilityError> {
    let doc: Value = serde_json::from_slice(payload)
        .map_err(|e| CapabilityError::Verification(format!("invalid signature payload: {e}")))?;
    let critical = &doc["critical"];

    let reference = critical["identity"]["docker-reference"].as_str().unwrap_or_default();
    let expected = options.info.reference();
    if reference != expected {
        return Err(CapabilityError::Verification(format!(
            "signature is for {reference}, not {expected}"
        )));
    }

    if !options.info.digest.is_empty() {
        let digest = critical["image"]["docker-manifest-digest"].as_str().unwrap_or_default();
        if digest != options.info.digest {
            return Err(CapabilityError::Verification(format!(
                "signature is for digest {digest}, not {}",
                options.info.digest
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ImageVerifier for SignatureStore {
    async fn verify_signature(&self, options: &VerifyOptions) -> Result<(), CapabilityError> {
        if options.ignore_tlog || options.ignore_sct {
            trace!(image = %options.image, "transparency checks disabled");
        } else {
            debug!(
                image = %options.image,
                rekor = %options.rekor_url,
                "transparency log not consulted offline"
            );
        }

        let entry = self
            .entry(options)
            .filter(|e| !e.signatures.is_empty())
            .ok_or_else(|| {
                CapabilityError::Verification(format!("no signatures found for {}", options.image))
            })?;

        let mut last_error = None;
        for stored in &entry.signatures {
            let result = decode(&stored.payload, "payload").and_then(|payload| {
                Self::check(
                    &options.authority,
                    &payload,
                    &stored.signature,
                    stored.certificate.as_deref(),
                )?;
                check_payload(&payload, options)
            });
            match result {
                Ok(()) => return Ok(()),
                Err(CapabilityError::Operational(e)) => return Err(CapabilityError::Operational(e)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(CapabilityError::Verification(format!(
            "no matching signatures for {}: {}",
            options.image,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn fetch_attestations(
        &self,
        options: &VerifyOptions,
    ) -> Result<Vec<Statement>, CapabilityError> {
        let Some(entry) = self.entry(options) else {
            return Err(CapabilityError::Verification(format!(
                "no attestations found for {}",
                options.image
            )));
        };

        let mut statements = Vec::new();
        for envelope in &entry.attestations {
            let payload = decode(&envelope.payload, "attestation payload")?;
            let signed = pae(&envelope.payload_type, &payload);
            let mut verified = false;
            for sig in &envelope.signatures {
                let certificate = sig.certificate.as_deref();
                match Self::check(&options.authority, &signed, &sig.sig, certificate) {
                    Ok(()) => {
                        verified = true;
                        break;
                    }
                    Err(CapabilityError::Operational(e)) => {
                        return Err(CapabilityError::Operational(e));
                    }
                    Err(e) => trace!(error = %e, "attestation signature rejected"),
                }
            }
            if !verified {
                debug!(image = %options.image, "skipping unverified attestation");
                continue;
            }

            let body: Value = serde_json::from_slice(&payload).map_err(|e| {
                CapabilityError::Verification(format!("invalid attestation statement: {e}"))
            })?;
            let statement = Statement::new(body);
            if options
                .predicate_type
                .as_deref()
                .is_none_or(|t| t == statement.predicate_type)
            {
                statements.push(statement);
            }
        }
        Ok(statements)
    }
}
