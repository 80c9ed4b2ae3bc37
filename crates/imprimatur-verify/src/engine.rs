//! Policy engine: applies verification policies to a resource.
//!
//! For each rule the engine checks the match block, extracts images, builds
//! the rule scope (`images` plus the rule's context entries), substitutes
//! the verification entries and verifies every image. Rules run
//! concurrently, as do the images of a rule, bounded by
//! [`EngineConfig::concurrency`]. Each rule and image works in its own fork
//! of the context, so nothing bound in one is visible to another.

use std::pin::pin;

use futures::stream::{self, StreamExt};
use imprimatur_policy::expression;
use imprimatur_policy::extract::extract_images;
use imprimatur_policy::matching::matches;
use imprimatur_policy::policy::{
    ApiCall, ContextEntry, ContextSource, ImageVerificationPolicy, Rule, Variable,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::capability::ApiRequest;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::VerificationError;
use crate::substitute::{substitute, substitute_rule};
use crate::verify::{
    Capabilities, VerificationOutcome, VerificationResult, Verifier, VerifySettings,
    call_with_timeout,
};

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponse {
    /// Rule name.
    pub name: String,
    /// Combined outcome.
    pub outcome: VerificationOutcome,
    /// Why the rule was skipped or errored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Per-image results.
    pub results: Vec<VerificationResult>,
}

impl RuleResponse {
    fn skipped(name: &str, message: String) -> Self {
        Self {
            name: name.to_owned(),
            outcome: VerificationOutcome::Skip,
            message: Some(message),
            results: Vec::new(),
        }
    }

    fn error(name: &str, err: &VerificationError) -> Self {
        Self {
            name: name.to_owned(),
            outcome: VerificationOutcome::Error,
            message: Some(err.to_string()),
            results: Vec::new(),
        }
    }
}

/// Result of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyResponse {
    /// Policy name.
    pub name: String,
    /// One response per rule, in policy order.
    pub rules: Vec<RuleResponse>,
}

/// Results of every policy applied to one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineResponse {
    /// One response per policy, in input order.
    pub policies: Vec<PolicyResponse>,
}

impl EngineResponse {
    /// Whether no rule failed or errored.
    pub fn is_success(&self) -> bool {
        self.rules().all(|rule| !rule.outcome.is_failure())
    }

    /// All rule responses.
    pub fn rules(&self) -> impl Iterator<Item = &RuleResponse> {
        self.policies.iter().flat_map(|p| p.rules.iter())
    }
}

/// Combine image outcomes: ERROR over FAIL over PASS over SKIP.
pub fn rule_outcome(results: &[VerificationResult]) -> VerificationOutcome {
    let has = |outcome: VerificationOutcome| results.iter().any(|r| r.outcome == outcome);
    if has(VerificationOutcome::Error) {
        VerificationOutcome::Error
    } else if has(VerificationOutcome::Fail) {
        VerificationOutcome::Fail
    } else if has(VerificationOutcome::Pass) {
        VerificationOutcome::Pass
    } else {
        VerificationOutcome::Skip
    }
}

/// Applies image verification policies.
#[derive(Clone)]
pub struct PolicyEngine {
    capabilities: Capabilities,
    config: EngineConfig,
}

impl PolicyEngine {
    /// An engine using `capabilities`.
    pub fn new(capabilities: Capabilities, config: EngineConfig) -> Self {
        Self {
            capabilities,
            config,
        }
    }

    /// Apply `policies` to `resource`.
    pub async fn apply(
        &self,
        policies: &[ImageVerificationPolicy],
        resource: &Value,
    ) -> EngineResponse {
        let base = Context::with_resource(resource.clone());
        let mut response = EngineResponse::default();
        for policy in policies {
            let span = info_span!("policy", name = %policy.name());
            let rules = self.apply_policy(policy, &base).instrument(span).await;
            response.policies.push(PolicyResponse {
                name: policy.name().to_owned(),
                rules,
            });
        }
        response
    }

    async fn apply_policy(
        &self,
        policy: &ImageVerificationPolicy,
        base: &Context,
    ) -> Vec<RuleResponse> {
        stream::iter(&policy.spec.rules)
            .map(|rule| {
                let span = info_span!("rule", name = %rule.name);
                self.apply_rule(rule, base).instrument(span)
            })
            .buffered(self.config.concurrency())
            .collect()
            .await
    }

    /// Apply one rule. `base` holds the resource.
    pub async fn apply_rule(&self, rule: &Rule, base: &Context) -> RuleResponse {
        let resource = base.get("resource").unwrap_or(&Value::Null);
        match matches(resource, &rule.match_) {
            Ok(mismatches) if !mismatches.is_empty() => {
                let reason = mismatches
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                debug!(rule = %rule.name, %reason, "resource does not match");
                return RuleResponse::skipped(&rule.name, format!("rule does not match: {reason}"));
            }
            Ok(_) => {}
            Err(err) => return RuleResponse::error(&rule.name, &err.into()),
        }

        match self.verify_rule(rule, base).await {
            Ok(response) => response,
            Err(err) => {
                warn!(rule = %rule.name, error = %err, "rule error");
                RuleResponse::error(&rule.name, &err)
            }
        }
    }

    async fn verify_rule(
        &self,
        rule: &Rule,
        base: &Context,
    ) -> Result<RuleResponse, VerificationError> {
        rule.validate()?;
        let resource = base.get("resource").unwrap_or(&Value::Null);
        let images = extract_images(resource, &rule.image_extractors)?;
        if images.is_empty() {
            return Ok(RuleResponse::skipped(&rule.name, "no images found".to_owned()));
        }

        let mut ctx = base.fork();
        ctx.add_variable("images", images.to_context_value());
        for entry in &rule.context {
            self.load_entry(entry, &mut ctx).await?;
        }
        let verify = substitute_rule(rule, &ctx)?;

        let settings = VerifySettings {
            call_timeout: self.config.call_timeout(),
            default_rekor_url: self.config.default_rekor_url.clone(),
        };
        let verifier = Verifier::new(&self.capabilities, &verify, rule.required_count(), &settings);
        let ctx = &ctx;
        let verifier = &verifier;
        let mut pending = pin!(
            stream::iter(images.iter())
                .map(|(key, image)| async move {
                    let mut scope = ctx.fork();
                    verifier.verify_image(key, image, &mut scope).await
                })
                .buffered(self.config.concurrency())
        );

        // An ERROR stops the rule; images not yet verified are dropped.
        let mut results = Vec::with_capacity(images.len());
        while let Some(result) = pending.next().await {
            let errored = result.outcome == VerificationOutcome::Error;
            results.push(result);
            if errored {
                warn!(rule = %rule.name, "operational error, remaining images not verified");
                break;
            }
        }

        let outcome = rule_outcome(&results);
        info!(rule = %rule.name, images = results.len(), %outcome, "rule evaluated");
        Ok(RuleResponse {
            name: rule.name.clone(),
            outcome,
            message: None,
            results,
        })
    }

    async fn load_entry(
        &self,
        entry: &ContextEntry,
        ctx: &mut Context,
    ) -> Result<(), VerificationError> {
        let value = match entry.source()? {
            ContextSource::Variable(variable) => load_variable(&entry.name, variable, ctx)?,
            ContextSource::ApiCall(call) => self.load_api_call(&entry.name, call, ctx).await?,
        };
        debug!(entry = %entry.name, "context entry loaded");
        ctx.add_variable(&entry.name, value);
        Ok(())
    }

    async fn load_api_call(
        &self,
        name: &str,
        call: &ApiCall,
        ctx: &Context,
    ) -> Result<Value, VerificationError> {
        let entry_error = |reason: String| VerificationError::ContextEntry {
            name: name.to_owned(),
            reason,
        };
        let call: ApiCall = substitute(call, ctx)?;
        let request = ApiRequest::from_call(&call).map_err(|e| entry_error(e.to_string()))?;
        let body = call_with_timeout(
            self.config.call_timeout(),
            "context api call",
            self.capabilities.api.call(&request),
        )
        .await?
        .map_err(|e| entry_error(e.to_string()))?;
        let data: Value = serde_json::from_slice(&body).map_err(|e| {
            entry_error(format!("failed to parse response from {}: {e}", request.url))
        })?;
        match call.jmes_path.as_deref().filter(|p| !p.is_empty()) {
            Some(projection) => Ok(expression::search(projection, &data)?),
            None => Ok(data),
        }
    }
}

/// Resolve a variable entry: substitute its value, project it, and fall
/// back to the default.
fn load_variable(
    name: &str,
    variable: &Variable,
    ctx: &Context,
) -> Result<Value, VerificationError> {
    let value = variable
        .value
        .as_ref()
        .map(|value| substitute(value, ctx))
        .transpose()?;
    let projection = variable.jmes_path.as_deref().filter(|p| !p.is_empty());

    let resolved = match (projection, value) {
        (Some(projection), Some(value)) => expression::search(projection, &value)?,
        (Some(projection), None) => ctx.query(projection)?,
        (None, Some(value)) => value,
        (None, None) => Value::Null,
    };

    match (resolved, &variable.default) {
        (Value::Null, Some(default)) => Ok(default.clone()),
        (Value::Null, None) => Err(VerificationError::ContextEntry {
            name: name.to_owned(),
            reason: "variable resolved to null and has no default".to_owned(),
        }),
        (value, _) => Ok(value),
    }
}
