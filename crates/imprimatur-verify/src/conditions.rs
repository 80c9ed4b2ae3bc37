//! Evaluation of substituted condition blocks.

use imprimatur_policy::condition::{AnyAllConditions, Condition, ConditionOperator};
use imprimatur_policy::glob;
use serde_json::Value;

/// Result of evaluating a list of condition blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Whether every block held.
    pub passed: bool,
    /// Why the first failing block failed; empty on success.
    pub message: String,
}

impl Evaluation {
    fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
        }
    }

    fn fail(message: String) -> Self {
        Self {
            passed: false,
            message,
        }
    }
}

/// Evaluate condition blocks; all blocks must hold.
///
/// Within a block every `all` condition must hold and, when `any` is not
/// empty, at least one `any` condition must hold.
pub fn evaluate(blocks: &[AnyAllConditions]) -> Evaluation {
    for block in blocks {
        if !block.any.is_empty() {
            let failures: Vec<String> = block
                .any
                .iter()
                .filter(|c| !holds(c))
                .map(describe)
                .collect();
            if failures.len() == block.any.len() {
                return Evaluation::fail(failures.join("; "));
            }
        }
        if let Some(failed) = block.all.iter().find(|c| !holds(c)) {
            return Evaluation::fail(describe(failed));
        }
    }
    Evaluation::pass()
}

fn describe(condition: &Condition) -> String {
    condition.message.clone().unwrap_or_else(|| {
        format!(
            "condition failed: {} {} {}",
            condition.key, condition.operator, condition.value
        )
    })
}

/// Whether a single condition holds.
pub fn holds(condition: &Condition) -> bool {
    let (key, value) = (&condition.key, &condition.value);
    match condition.operator {
        ConditionOperator::Equals => equals(key, value),
        ConditionOperator::NotEquals => !equals(key, value),
        ConditionOperator::In | ConditionOperator::AllIn => {
            elements(key).iter().all(|k| contains(value, k))
        }
        ConditionOperator::AnyIn => elements(key).iter().any(|k| contains(value, k)),
        ConditionOperator::NotIn | ConditionOperator::AllNotIn => {
            elements(key).iter().all(|k| !contains(value, k))
        }
        ConditionOperator::AnyNotIn => elements(key).iter().any(|k| !contains(value, k)),
        ConditionOperator::GreaterThan => compare(key, value).is_some_and(|o| o.is_gt()),
        ConditionOperator::GreaterThanOrEquals => compare(key, value).is_some_and(|o| o.is_ge()),
        ConditionOperator::LessThan => compare(key, value).is_some_and(|o| o.is_lt()),
        ConditionOperator::LessThanOrEquals => compare(key, value).is_some_and(|o| o.is_le()),
    }
}

/// Equality with wildcards on the value side and numeric comparison of
/// numbers.
fn equals(key: &Value, value: &Value) -> bool {
    match (key, value) {
        (Value::String(k), Value::String(v)) => glob::matches(v, k),
        (Value::Number(k), Value::Number(v)) => k.as_f64() == v.as_f64(),
        (Value::Array(k), Value::Array(v)) => {
            k.len() == v.len() && k.iter().zip(v).all(|(a, b)| equals(a, b))
        }
        (Value::Object(k), Value::Object(v)) => {
            k.len() == v.len()
                && k
                    .iter()
                    .all(|(name, a)| v.get(name).is_some_and(|b| equals(a, b)))
        }
        _ => key == value,
    }
}

fn elements(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn contains(set: &Value, item: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|candidate| equals(item, candidate)),
        other => equals(item, other),
    }
}

fn compare(key: &Value, value: &Value) -> Option<std::cmp::Ordering> {
    number(key)?.partial_cmp(&number(value)?)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
