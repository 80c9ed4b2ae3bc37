//! Rule match predicates.
//!
//! A clause is a pattern tree compared against the resource: objects must
//! contain every listed field, arrays must match element-wise, strings may
//! use `*`/`?` wildcards, numbers compare numerically, and everything else
//! must be equal.

use std::fmt;

use serde_json::Value;

use crate::error::PolicyError;
use crate::glob;
use crate::policy::Match;

/// Why a clause did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Location inside the predicate, e.g. `all[1].kind`.
    pub path: String,
    /// What differed.
    pub detail: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.detail)
    }
}

/// Evaluate `predicate` against `resource`.
///
/// An empty result means the rule applies. A malformed predicate is an
/// error, distinct from a mismatch.
pub fn matches(resource: &Value, predicate: &Match) -> Result<Vec<Mismatch>, PolicyError> {
    let mut mismatches = Vec::new();

    for (idx, clause) in predicate.all.iter().enumerate() {
        check_clause(clause, &format!("all[{idx}]"))?;
        compare(clause, resource, &format!("all[{idx}]"), &mut mismatches);
    }

    if !predicate.any.is_empty() {
        let mut any_mismatches = Vec::new();
        let mut satisfied = false;
        for (idx, clause) in predicate.any.iter().enumerate() {
            let path = format!("any[{idx}]");
            check_clause(clause, &path)?;
            let before = any_mismatches.len();
            compare(clause, resource, &path, &mut any_mismatches);
            if any_mismatches.len() == before {
                satisfied = true;
            }
        }
        if !satisfied {
            mismatches.extend(any_mismatches);
        }
    }

    Ok(mismatches)
}

fn check_clause(clause: &Value, path: &str) -> Result<(), PolicyError> {
    if clause.is_object() {
        Ok(())
    } else {
        Err(PolicyError::InvalidMatch(format!(
            "{path} must be an object, found {}",
            type_name(clause)
        )))
    }
}

fn compare(pattern: &Value, actual: &Value, path: &str, out: &mut Vec<Mismatch>) {
    let mut mismatch = |detail: String| {
        out.push(Mismatch {
            path: path.to_owned(),
            detail,
        });
    };

    match (pattern, actual) {
        (Value::Object(expected), Value::Object(found)) => {
            for (field, sub) in expected {
                let child = format!("{path}.{field}");
                match found.get(field) {
                    Some(value) => compare(sub, value, &child, out),
                    None => out.push(Mismatch {
                        path: child,
                        detail: "field not found".to_owned(),
                    }),
                }
            }
        }
        (Value::Array(expected), Value::Array(found)) => {
            if expected.len() == found.len() {
                for (idx, (sub, value)) in expected.iter().zip(found).enumerate() {
                    compare(sub, value, &format!("{path}[{idx}]"), out);
                }
            } else {
                mismatch(format!(
                    "expected {} elements, found {}",
                    expected.len(),
                    found.len()
                ));
            }
        }
        (Value::Object(_) | Value::Array(_), _) => mismatch(format!(
            "expected {}, found {}",
            type_name(pattern),
            type_name(actual)
        )),
        (Value::String(expected), Value::String(found)) => {
            if !glob::matches(expected, found) {
                mismatch(format!("expected {pattern}, found {actual}"));
            }
        }
        (Value::Number(expected), Value::Number(found)) => {
            if expected.as_f64() != found.as_f64() {
                mismatch(format!("expected {pattern}, found {actual}"));
            }
        }
        _ => {
            if pattern != actual {
                mismatch(format!("expected {pattern}, found {actual}"));
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
