//! Condition trees used by attestation and external-service checks.
//!
//! Conditions are evaluated by `imprimatur-verify` after their keys and
//! values have been substituted against the innermost context scope.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One block of conditions: every `all` entry and, when present, at least
/// one `any` entry must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnyAllConditions {
    /// At least one must pass (ignored when empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
    /// All must pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
}

/// A single comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Left-hand side, usually a `{{ ... }}` template.
    pub key: Value,
    /// Comparison operator.
    pub operator: ConditionOperator,
    /// Right-hand side.
    #[serde(default)]
    pub value: Value,
    /// Message reported when the condition does not hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Supported comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    /// Key equals value.
    Equals,
    /// Key differs from value.
    NotEquals,
    /// Key (or every element of key) is contained in value.
    In,
    /// At least one element of key is contained in value.
    AnyIn,
    /// Every element of key is contained in value.
    AllIn,
    /// Key (or every element of key) is absent from value.
    NotIn,
    /// At least one element of key is absent from value.
    AnyNotIn,
    /// Every element of key is absent from value.
    AllNotIn,
    /// Numeric `key > value`.
    GreaterThan,
    /// Numeric `key >= value`.
    GreaterThanOrEquals,
    /// Numeric `key < value`.
    LessThan,
    /// Numeric `key <= value`.
    LessThanOrEquals,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Equals => "Equals",
            Self::NotEquals => "NotEquals",
            Self::In => "In",
            Self::AnyIn => "AnyIn",
            Self::AllIn => "AllIn",
            Self::NotIn => "NotIn",
            Self::AnyNotIn => "AnyNotIn",
            Self::AllNotIn => "AllNotIn",
            Self::GreaterThan => "GreaterThan",
            Self::GreaterThanOrEquals => "GreaterThanOrEquals",
            Self::LessThan => "LessThan",
            Self::LessThanOrEquals => "LessThanOrEquals",
        };
        f.write_str(name)
    }
}
