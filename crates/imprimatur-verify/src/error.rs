//! Error types for the verification subsystem.

use imprimatur_policy::PolicyError;
use imprimatur_policy::expression::ExpressionError;

/// Errors from the verification subsystem.
///
/// Every variant is a configuration or operational error: it turns the
/// affected rule or image into an ERROR result. Failures to verify are not
/// errors; they are recorded on the result.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The policy or one of its rules is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A JMESPath expression failed.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A template referenced a variable that resolved to nothing.
    #[error("variable {expression} could not be resolved")]
    UnresolvedVariable {
        /// The template expression.
        expression: String,
    },

    /// A template is malformed.
    #[error("invalid template `{0}`")]
    InvalidTemplate(String),

    /// A context entry could not be loaded.
    #[error("failed to load context entry `{name}`: {reason}")]
    ContextEntry {
        /// The entry name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Signature verification failed.
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    /// An external capability could not be reached or used.
    #[error("{0}")]
    Operational(String),

    /// An external call exceeded its time budget.
    #[error("{what} timed out after {secs}s")]
    Timeout {
        /// The call that timed out.
        what: String,
        /// The configured timeout.
        secs: u64,
    },

    /// An engine configuration file is invalid.
    #[error("invalid configuration `{path}`: {source}")]
    InvalidConfig {
        /// The file that failed to parse.
        path: String,
        /// Parser error.
        source: toml::de::Error,
    },

    /// I/O error during verification.
    #[error("verification I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
