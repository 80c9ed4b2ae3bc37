//! External capabilities consumed by the orchestrator.
//!
//! Signature and attestation checks go through [`ImageVerifier`]; API calls
//! go through [`ApiCaller`]. Both distinguish a failure to verify from an
//! operational failure so the orchestrator can tell FAIL from ERROR.

use async_trait::async_trait;
use imprimatur_policy::PolicyError;
use imprimatur_policy::image::ImageInfo;
use imprimatur_policy::policy::{self, Cosign, CosignAuthority, HttpHeader, Method, Notary};
use serde_json::{Map, Value};

/// Error returned by a capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    /// The image did not verify. Recorded as a failure.
    #[error("{0}")]
    Verification(String),

    /// The capability could not do its job. Recorded as an error.
    #[error("{0}")]
    Operational(String),
}

/// Signature scheme an option set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Cosign signatures and in-toto attestations.
    Cosign,
    /// Notary signatures and attestations.
    Notary,
}

/// Who is trusted to have signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// A PEM public key.
    Key {
        /// PEM-encoded public key.
        public_key: String,
    },
    /// A keyless (Fulcio) identity.
    Keyless {
        /// Expected OIDC issuer.
        issuer: String,
        /// Expected subject; wildcards allowed.
        subject: String,
        /// Custom roots (PEM).
        roots: String,
    },
    /// A signing certificate.
    Certificate {
        /// PEM-encoded certificate.
        cert: String,
        /// PEM-encoded chain.
        chain: String,
    },
}

/// Everything a verifier needs for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Canonical image reference.
    pub image: String,
    /// Parsed image reference.
    pub info: ImageInfo,
    /// Signature scheme.
    pub scheme: Scheme,
    /// Trusted signer.
    pub authority: Authority,
    /// Rekor URL.
    pub rekor_url: String,
    /// Rekor public key (PEM).
    pub rekor_pub_key: String,
    /// CT log public key (PEM).
    pub ctlog_pub_key: String,
    /// Alternate signature repository.
    pub repository: String,
    /// Signature algorithm.
    pub signature_algorithm: String,
    /// Skip transparency log checks.
    pub ignore_tlog: bool,
    /// Skip SCT checks.
    pub ignore_sct: bool,
    /// Timestamp authority chain.
    pub tsa_cert_chain: String,
    /// Whether attestations will be fetched.
    pub fetch_attestations: bool,
    /// Predicate type filter for attestation fetches.
    pub predicate_type: Option<String>,
}

impl VerifyOptions {
    /// Options for a cosign entry.
    pub fn cosign(
        cosign: &Cosign,
        info: &ImageInfo,
        default_rekor_url: &str,
    ) -> Result<Self, PolicyError> {
        let authority = match cosign.authority()? {
            CosignAuthority::Key(key) => Authority::Key {
                public_key: key.public_key.clone(),
            },
            CosignAuthority::Keyless(keyless) => Authority::Keyless {
                issuer: keyless.issuer.clone(),
                subject: keyless.subject.clone(),
                roots: keyless.root.clone(),
            },
            CosignAuthority::Certificate(cert) => Authority::Certificate {
                cert: cert.cert.clone(),
                chain: cert.cert_chain.clone(),
            },
        };
        let rekor = cosign.rekor.clone().unwrap_or_default();
        let rekor_url = if rekor.url.is_empty() {
            default_rekor_url.to_owned()
        } else {
            rekor.url
        };

        Ok(Self {
            image: info.to_string(),
            info: info.clone(),
            scheme: Scheme::Cosign,
            authority,
            rekor_url,
            rekor_pub_key: rekor.pub_key,
            ctlog_pub_key: cosign
                .ctlog
                .as_ref()
                .map(|c| c.pub_key.clone())
                .unwrap_or_default(),
            repository: cosign.repository.clone(),
            signature_algorithm: cosign.signature_algorithm.clone(),
            ignore_tlog: cosign.ignore_tlog,
            ignore_sct: cosign.ignore_sct,
            tsa_cert_chain: cosign.tsa_cert_chain.clone(),
            fetch_attestations: !cosign.intoto_attestations.is_empty(),
            predicate_type: None,
        })
    }

    /// Options for a notary entry.
    pub fn notary(notary: &Notary, info: &ImageInfo) -> Self {
        Self {
            image: info.to_string(),
            info: info.clone(),
            scheme: Scheme::Notary,
            authority: Authority::Certificate {
                cert: notary.certs.clone(),
                chain: String::new(),
            },
            rekor_url: String::new(),
            rekor_pub_key: String::new(),
            ctlog_pub_key: String::new(),
            repository: String::new(),
            signature_algorithm: String::new(),
            ignore_tlog: true,
            ignore_sct: true,
            tsa_cert_chain: String::new(),
            fetch_attestations: !notary.attestations.is_empty(),
            predicate_type: None,
        }
    }

    /// A copy filtered to one predicate type.
    #[must_use]
    pub fn for_predicate(&self, predicate_type: &str) -> Self {
        Self {
            predicate_type: Some(predicate_type.to_owned()),
            fetch_attestations: true,
            ..self.clone()
        }
    }
}

/// An attestation statement returned by a verifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The statement's predicate type.
    pub predicate_type: String,
    /// The whole statement.
    pub body: Value,
}

impl Statement {
    /// Wrap a decoded statement, reading its `predicateType`.
    pub fn new(body: Value) -> Self {
        let predicate_type = body
            .get("predicateType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Self {
            predicate_type,
            body,
        }
    }

    /// The statement's `predicate`, if it is an object.
    pub fn predicate(&self) -> Option<&Map<String, Value>> {
        self.body.get("predicate").and_then(Value::as_object)
    }
}

/// Signature and attestation verification.
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    /// Verify the image signature.
    async fn verify_signature(&self, options: &VerifyOptions) -> Result<(), CapabilityError>;

    /// Fetch verified attestation statements of `options.predicate_type`.
    async fn fetch_attestations(
        &self,
        options: &VerifyOptions,
    ) -> Result<Vec<Statement>, CapabilityError>;
}

/// A resolved API request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Full URL.
    pub url: String,
    /// JSON body (POST only).
    pub body: Option<Value>,
    /// Extra trusted CA certificates (PEM).
    pub ca_bundle: Option<String>,
    /// Extra headers.
    pub headers: Vec<HttpHeader>,
}

impl ApiRequest {
    /// Build a request from a substituted API call.
    pub fn from_call(call: &policy::ApiCall) -> Result<Self, CapabilityError> {
        let service = call
            .service
            .as_ref()
            .ok_or_else(|| CapabilityError::Operational("api call has no service".to_owned()))?;
        let body = match call.method {
            Method::Post => Some(Value::Object(
                call.data
                    .iter()
                    .map(|d| (d.key.clone(), d.value.clone()))
                    .collect(),
            )),
            Method::Get => None,
        };
        Ok(Self {
            method: call.method,
            url: service.url.clone(),
            body,
            ca_bundle: service.ca_bundle.clone().filter(|b| !b.trim().is_empty()),
            headers: service.headers.clone(),
        })
    }
}

/// Executes API calls.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    /// Execute the request and return the raw response body.
    async fn call(&self, request: &ApiRequest) -> Result<Vec<u8>, CapabilityError>;
}
