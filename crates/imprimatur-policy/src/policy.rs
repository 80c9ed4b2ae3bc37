//! The `ImageVerificationPolicy` document model.
//!
//! A policy is an ordered list of rules. Each rule gates on a match
//! predicate, extracts images from the resource, optionally seeds context
//! entries, and lists sub-verifications. A sub-verification applies to the
//! images matching its `imageReferences` patterns and bundles any number of
//! cosign, notary, and external-service attestors.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::condition::AnyAllConditions;
use crate::error::PolicyError;

/// The only document kind accepted by the loader.
pub const POLICY_KIND: &str = "ImageVerificationPolicy";

/// Default Rekor instance for cosign verification.
pub const DEFAULT_REKOR_URL: &str = "https://rekor.sigstore.dev";

/// A named set of image verification rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerificationPolicy {
    /// API version, informational only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Must be [`POLICY_KIND`].
    #[serde(default)]
    pub kind: String,
    /// Identity of the policy.
    #[serde(default)]
    pub metadata: Metadata,
    /// The rules.
    pub spec: PolicySpec,
}

/// Policy identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Policy name.
    #[serde(default)]
    pub name: String,
}

/// Policy body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Rules, evaluated in order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl ImageVerificationPolicy {
    /// The policy name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Validate every rule.
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.spec.rules.iter().try_for_each(Rule::validate)
    }
}

/// One policy clause: match gate, image extraction, and verification set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Rule name.
    pub name: String,
    /// Predicate deciding whether the rule applies to a resource.
    #[serde(default, rename = "match")]
    pub match_: Match,
    /// Where to find images in the resource.
    #[serde(default)]
    pub image_extractors: Vec<ImageExtractorConfig>,
    /// Variables and API lookups made available to templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextEntry>,
    /// Minimum passing sub-verifications; zero or less means all of them.
    #[serde(default)]
    pub count: i64,
    /// Sub-verifications.
    #[serde(default)]
    pub verify: Vec<VerificationRule>,
}

impl Rule {
    /// The effective quorum threshold.
    pub fn required_count(&self) -> usize {
        usize::try_from(self.count)
            .ok()
            .filter(|c| *c > 0)
            .unwrap_or(self.verify.len())
    }

    /// Check the structural invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| PolicyError::InvalidRule {
            rule: self.name.clone(),
            reason,
        };

        if self.image_extractors.is_empty() {
            return Err(invalid("at least one image extractor is required".to_owned()));
        }
        for extractor in &self.image_extractors {
            if extractor.path.split('/').all(|s| s.trim().is_empty()) && extractor.value.is_none() {
                return Err(invalid(format!(
                    "image extractor path `{}` has no value field",
                    extractor.path
                )));
            }
        }
        for entry in &self.context {
            entry.source()?;
        }
        for (idx, verification) in self.verify.iter().enumerate() {
            verification
                .validate()
                .map_err(|e| invalid(format!("verify[{idx}]: {e}")))?;
        }
        Ok(())
    }
}

/// `all`/`any` predicate over the resource.
///
/// Each clause is a pattern tree: objects must contain the listed fields,
/// arrays must match element-wise, scalars must be equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// At least one clause must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Value>,
    /// Every clause must match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Value>,
}

impl Match {
    /// Returns `true` when the predicate has no clauses.
    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.all.is_empty()
    }
}

/// Locates image references inside a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageExtractorConfig {
    /// Slash-separated path; `*` expands arrays and objects.
    pub path: String,
    /// Field holding the image; defaults to the last path segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Group name, `custom` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Sibling field whose value identifies the image instead of its pointer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Normalizer applied to the raw image string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
}

/// A named value made available to templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    /// Variable name; dots create nested objects.
    pub name: String,
    /// Load the value from an API call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ApiCall>,
    /// Define the value inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<Variable>,
}

/// Where a context entry's value comes from.
#[derive(Debug, Clone, Copy)]
pub enum ContextSource<'a> {
    /// Inline variable.
    Variable(&'a Variable),
    /// External API call.
    ApiCall(&'a ApiCall),
}

impl ContextEntry {
    /// Exactly one of `variable` and `apiCall` must be set.
    pub fn source(&self) -> Result<ContextSource<'_>, PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidContextEntry {
            name: self.name.clone(),
            reason: reason.to_owned(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is required"));
        }
        match (&self.variable, &self.api_call) {
            (Some(variable), None) => Ok(ContextSource::Variable(variable)),
            (None, Some(call)) => {
                call.validate().map_err(|reason| invalid(&reason))?;
                Ok(ContextSource::ApiCall(call))
            }
            (Some(_), Some(_)) => Err(invalid("only one of `variable` or `apiCall` may be set")),
            (None, None) => Err(invalid("one of `variable` or `apiCall` is required")),
        }
    }
}

/// Inline context variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    /// Literal value; templates inside it are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Expression applied to `value`, or to the whole context without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
    /// Fallback when the result is null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A JSON web-service request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCall {
    /// Cluster API path. Not supported: there is no cluster client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    /// HTTP method.
    #[serde(default)]
    pub method: Method,
    /// Request body fields (POST only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<RequestData>,
    /// Target service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceCall>,
    /// Projection applied to the JSON response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmes_path: Option<String>,
}

impl ApiCall {
    fn validate(&self) -> Result<(), String> {
        if self.url_path.is_some() {
            return Err("`urlPath` calls require a cluster client and are not supported".to_owned());
        }
        match &self.service {
            Some(service) if !service.url.trim().is_empty() => {}
            _ => return Err("`service.url` is required".to_owned()),
        }
        if self.method == Method::Get && !self.data.is_empty() {
            return Err("`data` is only allowed with POST".to_owned());
        }
        Ok(())
    }
}

/// HTTP method of an API call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    #[default]
    Get,
    /// `POST`
    Post,
}

/// One request body field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// Field name.
    pub key: String,
    /// Field value; templates inside it are substituted.
    pub value: Value,
}

/// Service endpoint of an API call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCall {
    /// Full URL.
    pub url: String,
    /// PEM bundle trusted for TLS, in addition to the system roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// Extra request headers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HttpHeader>,
}

/// An HTTP header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpHeader {
    /// Header name.
    pub key: String,
    /// Header value.
    pub value: String,
}

/// One sub-verification: image patterns plus attestors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRule {
    /// Patterns (`*`, `?`) selecting the images this entry applies to.
    #[serde(deserialize_with = "one_or_many")]
    pub image_references: Vec<String>,
    /// Cosign signature checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cosign: Vec<Cosign>,
    /// Notary signature checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notary: Vec<Notary>,
    /// External API checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_service: Vec<ExternalService>,
}

/// One attestor inside a sub-verification.
#[derive(Debug, Clone, Copy)]
pub enum Attestor<'a> {
    /// Cosign signature (and in-toto attestations).
    Cosign(&'a Cosign),
    /// Notary signature (and attestations).
    Notary(&'a Notary),
    /// External API check.
    ExternalService(&'a ExternalService),
}

impl VerificationRule {
    /// All attestors in evaluation order: cosign, notary, external.
    pub fn attestors(&self) -> impl Iterator<Item = Attestor<'_>> {
        self.cosign
            .iter()
            .map(Attestor::Cosign)
            .chain(self.notary.iter().map(Attestor::Notary))
            .chain(self.external_service.iter().map(Attestor::ExternalService))
    }

    /// Check attestor invariants.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for cosign in &self.cosign {
            cosign.authority()?;
        }
        for external in &self.external_service {
            let call = external.api_call.as_ref().ok_or_else(|| PolicyError::InvalidContextEntry {
                name: "externalService".to_owned(),
                reason: "`apiCall` is required".to_owned(),
            })?;
            call.validate()
                .map_err(|reason| PolicyError::InvalidContextEntry {
                    name: "externalService".to_owned(),
                    reason,
                })?;
        }
        Ok(())
    }
}

/// Cosign verification settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cosign {
    /// Public key authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    /// Keyless (Fulcio identity) authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyless: Option<Keyless>,
    /// Certificate authority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    /// Transparency log overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rekor: Option<Rekor>,
    /// Certificate transparency overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlog: Option<CtLog>,
    /// Signature algorithm, e.g. `sha256`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature_algorithm: String,
    /// Alternate repository holding signatures.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    /// Skip transparency log checks.
    #[serde(default)]
    pub ignore_tlog: bool,
    /// Skip signed certificate timestamp checks.
    #[serde(default, rename = "ignoreSCT")]
    pub ignore_sct: bool,
    /// Timestamp authority chain.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tsa_cert_chain: String,
    /// In-toto attestation checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intoto_attestations: Vec<Attestation>,
}

/// The single authority of a cosign entry.
#[derive(Debug, Clone, Copy)]
pub enum CosignAuthority<'a> {
    /// Public key.
    Key(&'a Key),
    /// Keyless identity.
    Keyless(&'a Keyless),
    /// Certificate.
    Certificate(&'a Certificate),
}

impl Cosign {
    /// Exactly one of key, keyless, certificate must be set.
    pub fn authority(&self) -> Result<CosignAuthority<'_>, PolicyError> {
        match (&self.key, &self.keyless, &self.certificate) {
            (Some(key), None, None) => Ok(CosignAuthority::Key(key)),
            (None, Some(keyless), None) => Ok(CosignAuthority::Keyless(keyless)),
            (None, None, Some(cert)) => Ok(CosignAuthority::Certificate(cert)),
            (None, None, None) => Err(PolicyError::MissingAuthority),
            _ => Err(PolicyError::MultipleAttestors),
        }
    }
}

/// Public key authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    /// PEM-encoded public key.
    #[serde(default)]
    pub public_key: String,
}

/// Keyless authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyless {
    /// Expected OIDC issuer.
    #[serde(default)]
    pub issuer: String,
    /// Expected certificate subject; wildcards allowed.
    #[serde(default)]
    pub subject: String,
    /// Custom Fulcio roots (PEM).
    #[serde(default)]
    pub root: String,
}

/// Certificate authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    /// PEM-encoded signing certificate.
    #[serde(default)]
    pub cert: String,
    /// PEM-encoded chain.
    #[serde(default)]
    pub cert_chain: String,
}

/// Rekor settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rekor {
    /// Rekor URL.
    #[serde(default)]
    pub url: String,
    /// Rekor public key (PEM).
    #[serde(default)]
    pub pub_key: String,
}

/// CT log settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtLog {
    /// CT log public key (PEM).
    #[serde(default)]
    pub pub_key: String,
}

/// Notary verification settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notary {
    /// PEM-encoded certificates.
    #[serde(default)]
    pub certs: String,
    /// Attestation checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestations: Vec<Attestation>,
}

/// External API check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalService {
    /// The call to make.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_call: Option<ApiCall>,
    /// Conditions over the response.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AnyAllConditions>,
}

/// An attestation check for one predicate type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    /// Predicate type URI.
    #[serde(default, rename = "type")]
    pub predicate_type: String,
    /// Conditions over each statement's predicate. Without conditions the
    /// check passes as long as statements of the type exist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<AnyAllConditions>,
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(pattern) => vec![pattern],
        OneOrMany::Many(patterns) => patterns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> VerificationRule {
        serde_json::from_str(json).expect("parse verification rule")
    }

    #[test]
    fn single_authority_is_valid() {
        for json in [
            r#"{"imageReferences":"*","cosign":[{"key":{"publicKey":""}}]}"#,
            r#"{"imageReferences":"*","cosign":[{"keyless":{"issuer":"","subject":"","root":""}}]}"#,
            r#"{"imageReferences":"*","cosign":[{"certificate":{"cert":"","certChain":""}}]}"#,
        ] {
            parse(json).validate().expect(json);
        }
    }

    #[test]
    fn multiple_authorities_rejected() {
        for json in [
            r#"{"imageReferences":"*","cosign":[{"key":{"publicKey":""},"keyless":{"issuer":"","subject":"","root":""}}]}"#,
            r#"{"imageReferences":"*","cosign":[{"key":{"publicKey":""},"certificate":{"cert":"","certChain":""}}]}"#,
            r#"{"imageReferences":"*","cosign":[{"keyless":{"issuer":"","subject":"","root":""},"certificate":{"cert":"","certChain":""}}]}"#,
            r#"{"imageReferences":"*","cosign":[{"key":{"publicKey":""},"keyless":{"issuer":"","subject":"","root":""},"certificate":{"cert":"","certChain":""}}]}"#,
        ] {
            let err = parse(json).validate().unwrap_err();
            assert!(matches!(err, PolicyError::MultipleAttestors), "{json}: {err}");
        }
    }

    #[test]
    fn missing_authority_rejected() {
        let err = parse(r#"{"imageReferences":"*","cosign":[{"ignoreTlog":true}]}"#)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PolicyError::MissingAuthority));
    }

    #[test]
    fn image_references_accepts_list() {
        let rule = parse(r#"{"imageReferences":["ghcr.io/a/*","ghcr.io/b/*"]}"#);
        assert_eq!(rule.image_references, vec!["ghcr.io/a/*", "ghcr.io/b/*"]);
    }

    #[test]
    fn cosign_field_names() {
        let rule = parse(
            r#"{"imageReferences":"*","cosign":[{"key":{"publicKey":"k"},"ignoreSCT":true,"ignoreTlog":true,"tsaCertChain":"c","intotoAttestations":[{"type":"https://slsa.dev/provenance/v1"}]}]}"#,
        );
        let cosign = &rule.cosign[0];
        assert!(cosign.ignore_sct && cosign.ignore_tlog);
        assert_eq!(cosign.tsa_cert_chain, "c");
        assert_eq!(cosign.intoto_attestations[0].predicate_type, "https://slsa.dev/provenance/v1");
    }

    #[test]
    fn attestors_in_declared_order() {
        let rule = parse(
            r#"{"imageReferences":"*","externalService":[{"apiCall":{"service":{"url":"http://x"}}}],"notary":[{"certs":""}],"cosign":[{"key":{"publicKey":""}}]}"#,
        );
        let kinds: Vec<&str> = rule
            .attestors()
            .map(|a| match a {
                Attestor::Cosign(_) => "cosign",
                Attestor::Notary(_) => "notary",
                Attestor::ExternalService(_) => "external",
            })
            .collect();
        assert_eq!(kinds, ["cosign", "notary", "external"]);
    }

    #[test]
    fn required_count_defaults_to_all() {
        let mut rule = Rule {
            verify: vec![VerificationRule::default(), VerificationRule::default()],
            ..Default::default()
        };
        assert_eq!(rule.required_count(), 2);
        rule.count = -3;
        assert_eq!(rule.required_count(), 2);
        rule.count = 1;
        assert_eq!(rule.required_count(), 1);
    }

    #[test]
    fn context_entry_requires_exactly_one_source() {
        let both = ContextEntry {
            name: "x".to_owned(),
            variable: Some(Variable::default()),
            api_call: Some(ApiCall::default()),
        };
        assert!(both.source().is_err());

        let neither = ContextEntry {
            name: "x".to_owned(),
            ..Default::default()
        };
        assert!(neither.source().is_err());

        let variable = ContextEntry {
            name: "x".to_owned(),
            variable: Some(Variable::default()),
            ..Default::default()
        };
        assert!(matches!(variable.source(), Ok(ContextSource::Variable(_))));
    }

    #[test]
    fn api_call_without_service_rejected() {
        let entry = ContextEntry {
            name: "lookup".to_owned(),
            api_call: Some(ApiCall {
                url_path: Some("/api/v1/namespaces".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = entry.source().unwrap_err();
        assert!(err.to_string().contains("urlPath"), "got: {err}");
    }

    #[test]
    fn rule_without_extractors_rejected() {
        let rule = Rule {
            name: "r".to_owned(),
            ..Default::default()
        };
        assert!(rule.validate().is_err());
    }
}
