//! `{{ expression }}` template substitution.
//!
//! A string that is exactly one template becomes the raw query result, so
//! `"{{ images.containers }}"` can produce an object. Templates embedded in
//! longer strings are rendered: strings verbatim, anything else as compact
//! JSON. `\{{` produces a literal `{{`.

use imprimatur_policy::Rule;
use imprimatur_policy::condition::AnyAllConditions;
use imprimatur_policy::policy::VerificationRule;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;
use crate::error::VerificationError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Substitute every template in a serializable value.
pub fn substitute<T>(item: &T, ctx: &Context) -> Result<T, VerificationError>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(item)?;
    substitute_value(&mut value, ctx)?;
    Ok(serde_json::from_value(value)?)
}

/// Substitute templates in place, recursing into arrays and object values.
pub fn substitute_value(value: &mut Value, ctx: &Context) -> Result<(), VerificationError> {
    match value {
        Value::String(text) if text.contains(OPEN) => {
            *value = substitute_str(text, ctx)?;
            Ok(())
        }
        Value::Array(items) => items.iter_mut().try_for_each(|item| substitute_value(item, ctx)),
        Value::Object(fields) => fields
            .values_mut()
            .try_for_each(|field| substitute_value(field, ctx)),
        _ => Ok(()),
    }
}

/// Substitute the templates of one string.
pub fn substitute_str(text: &str, ctx: &Context) -> Result<Value, VerificationError> {
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix(OPEN)
        .and_then(|rest| rest.strip_suffix(CLOSE))
        .filter(|inner| !inner.contains(OPEN) && !inner.contains(CLOSE))
    {
        return resolve(inner.trim(), ctx);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        if rest[..start].ends_with('\\') {
            out.push_str(&rest[..start - 1]);
            out.push_str(OPEN);
            rest = &rest[start + OPEN.len()..];
            continue;
        }
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let end = after
            .find(CLOSE)
            .ok_or_else(|| VerificationError::InvalidTemplate(text.to_owned()))?;
        match resolve(after[..end].trim(), ctx)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + CLOSE.len()..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn resolve(expression: &str, ctx: &Context) -> Result<Value, VerificationError> {
    if expression.is_empty() {
        return Err(VerificationError::InvalidTemplate(format!("{OPEN}{CLOSE}")));
    }
    match ctx.query(expression)? {
        Value::Null => Err(VerificationError::UnresolvedVariable {
            expression: expression.to_owned(),
        }),
        value => Ok(value),
    }
}

/// Substitute a rule's verification entries against the rule scope.
///
/// Attestation and external-service conditions are left untouched: they
/// refer to data that only exists while a single response or statement is
/// in scope.
pub fn substitute_rule(
    rule: &Rule,
    ctx: &Context,
) -> Result<Vec<VerificationRule>, VerificationError> {
    let mut verify = rule.verify.clone();
    let held = take_conditions(&mut verify);
    let mut substituted = substitute(&verify, ctx)?;
    put_conditions(&mut substituted, held);
    Ok(substituted)
}

fn take_conditions(verify: &mut [VerificationRule]) -> Vec<Vec<AnyAllConditions>> {
    let mut held = Vec::new();
    for entry in verify {
        for cosign in &mut entry.cosign {
            for attestation in &mut cosign.intoto_attestations {
                held.push(std::mem::take(&mut attestation.conditions));
            }
        }
        for notary in &mut entry.notary {
            for attestation in &mut notary.attestations {
                held.push(std::mem::take(&mut attestation.conditions));
            }
        }
        for external in &mut entry.external_service {
            held.push(std::mem::take(&mut external.conditions));
        }
    }
    held
}

fn put_conditions(verify: &mut [VerificationRule], held: Vec<Vec<AnyAllConditions>>) {
    let mut held = held.into_iter();
    for entry in verify {
        for cosign in &mut entry.cosign {
            for attestation in &mut cosign.intoto_attestations {
                attestation.conditions = held.next().unwrap_or_default();
            }
        }
        for notary in &mut entry.notary {
            for attestation in &mut notary.attestations {
                attestation.conditions = held.next().unwrap_or_default();
            }
        }
        for external in &mut entry.external_service {
            external.conditions = held.next().unwrap_or_default();
        }
    }
}

/// Substitute the keys and values of condition blocks.
pub fn substitute_conditions(
    conditions: &[AnyAllConditions],
    ctx: &Context,
) -> Result<Vec<AnyAllConditions>, VerificationError> {
    substitute(&conditions.to_vec(), ctx)
}
