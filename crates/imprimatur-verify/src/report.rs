//! Human-readable and JSON rendering of engine responses.

use std::fmt::Write as _;

use crate::engine::{EngineResponse, RuleResponse};
use crate::verify::{VerificationOutcome, VerificationResult};

/// Render `response` as the text report printed by the CLI.
pub fn render_text(response: &EngineResponse) -> String {
    let mut out = String::from("Verification Result:\n");
    for policy in &response.policies {
        let _ = writeln!(out, "Results for policy: {}", policy.name);
        for rule in &policy.rules {
            render_rule(&mut out, rule);
        }
    }
    out
}

fn render_rule(out: &mut String, rule: &RuleResponse) {
    let _ = writeln!(out, "  Results for rule: {}", rule.name);
    if rule.results.is_empty() {
        let _ = write!(out, "    Rule result: {}", rule.outcome);
        match &rule.message {
            Some(message) => {
                let _ = writeln!(out, " ({message})");
            }
            None => out.push('\n'),
        }
        return;
    }
    for result in &rule.results {
        render_image(out, result);
    }
}

fn render_image(out: &mut String, result: &VerificationResult) {
    let _ = writeln!(
        out,
        "    Verifying image: {}, result: {}",
        result.image, result.outcome
    );
    match result.outcome {
        VerificationOutcome::Fail => {
            out.push_str("      Failures:\n");
            for failure in result.failures() {
                let _ = writeln!(out, "        - {failure}");
            }
        }
        VerificationOutcome::Error => {
            let error = result.error.as_deref().unwrap_or("unknown error");
            let _ = writeln!(out, "      Error encountered: {error}");
        }
        VerificationOutcome::Pass | VerificationOutcome::Skip => {}
    }
}

/// Render `response` as pretty-printed JSON.
pub fn render_json(response: &EngineResponse) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(response)
}
