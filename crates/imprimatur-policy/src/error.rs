//! Error types for the policy subsystem.

use crate::expression::ExpressionError;
use crate::image::ReferenceError;

/// Errors from loading, validating, or applying a policy to a resource.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A cosign entry names more than one of key, keyless, certificate.
    #[error("multiple attestor cannot be added in the same entry")]
    MultipleAttestors,

    /// A cosign entry names none of key, keyless, certificate.
    #[error("cosign entry requires one of `key`, `keyless` or `certificate`")]
    MissingAuthority,

    /// A context entry is not exactly one of variable or API call.
    #[error("invalid context entry `{name}`: {reason}")]
    InvalidContextEntry {
        /// The entry name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A rule failed validation.
    #[error("invalid rule `{rule}`: {reason}")]
    InvalidRule {
        /// The rule name.
        rule: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An image extractor path could not be interpreted.
    #[error("invalid image extractor path `{0}`")]
    InvalidPath(String),

    /// A wildcard segment was applied to a scalar.
    #[error("invalid type at `{pointer}`: wildcard requires an array or object")]
    InvalidType {
        /// Location of the offending node.
        pointer: String,
    },

    /// A literal segment or leaf was applied to a non-object.
    #[error("invalid image config at `{pointer}`: expected an object")]
    InvalidImageConfig {
        /// Location of the offending node.
        pointer: String,
    },

    /// The configured key field is missing or not a string.
    #[error("invalid key: field `{field}` at `{pointer}` is missing or not a string")]
    InvalidKey {
        /// The configured key field.
        field: String,
        /// Location of the enclosing object.
        pointer: String,
    },

    /// An image string could not be parsed.
    #[error("invalid image '{image}' ({source})")]
    InvalidImage {
        /// The raw image string.
        image: String,
        /// Why it was rejected.
        source: ReferenceError,
    },

    /// A JMESPath expression failed to compile or evaluate.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A JMESPath normalizer produced something other than a string.
    #[error("jmespath {expression} must produce a string, but produced {produced}")]
    NotAString {
        /// The expression.
        expression: String,
        /// What it produced instead.
        produced: serde_json::Value,
    },

    /// A match predicate is malformed.
    #[error("invalid match: {0}")]
    InvalidMatch(String),

    /// A policy document has the wrong kind.
    #[error("unsupported document kind `{kind}` in `{path}`")]
    UnsupportedKind {
        /// The kind that was found.
        kind: String,
        /// The source file.
        path: String,
    },

    /// I/O error while loading policies.
    #[error("policy I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}
