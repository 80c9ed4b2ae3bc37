//! Per-image verification orchestrator.
//!
//! The [`Verifier`] runs a rule's sub-verifications against one image and
//! combines them with a quorum. A sub-verification whose image patterns do
//! not match is skipped; otherwise its cosign, notary and external-service
//! attestors run in order and any failure fails it. Operational errors stop
//! the image and turn it into an ERROR.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use imprimatur_policy::condition::AnyAllConditions;
use imprimatur_policy::expression;
use imprimatur_policy::extract::ExtractedImage;
use imprimatur_policy::glob;
use imprimatur_policy::policy::{
    Attestation, Attestor, Cosign, ExternalService, Notary, VerificationRule,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::capability::{ApiCaller, ApiRequest, CapabilityError, ImageVerifier, VerifyOptions};
use crate::conditions;
use crate::context::Context;
use crate::error::VerificationError;
use crate::substitute::substitute_conditions;

/// Terminal outcome of an image or a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerificationOutcome {
    /// Enough sub-verifications passed.
    Pass,
    /// Nothing applied.
    Skip,
    /// Too few sub-verifications passed.
    Fail,
    /// A configuration or operational error occurred.
    Error,
}

impl VerificationOutcome {
    /// Returns `true` for FAIL and ERROR.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Skip => "SKIP",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
        })
    }
}

/// Apply the quorum law.
///
/// PASS iff `passed >= required`; SKIP iff nothing passed or failed and
/// something was skipped; FAIL otherwise.
pub const fn quorum(
    passed: usize,
    failed: usize,
    skipped: usize,
    required: usize,
) -> VerificationOutcome {
    if passed >= required {
        VerificationOutcome::Pass
    } else if passed == 0 && failed == 0 && skipped > 0 {
        VerificationOutcome::Skip
    } else {
        VerificationOutcome::Fail
    }
}

/// What happened to one sub-verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    /// The sub-verification's image patterns.
    pub image_references: Vec<String>,
    /// The image did not match the patterns.
    pub skipped: bool,
    /// Failure messages; empty when it passed or was skipped.
    pub failures: Vec<String>,
}

/// Verification result for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// Canonical image reference.
    pub image: String,
    /// Location key the image was extracted under.
    pub key: String,
    /// Outcome.
    pub outcome: VerificationOutcome,
    /// The error, for ERROR outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// One response per sub-verification processed.
    pub responses: Vec<VerificationResponse>,
}

impl VerificationResult {
    /// All failure messages in order.
    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.responses
            .iter()
            .flat_map(|r| r.failures.iter().map(String::as_str))
    }
}

/// Capabilities used to verify images.
#[derive(Clone)]
pub struct Capabilities {
    /// Cosign signatures and in-toto attestations.
    pub cosign: Arc<dyn ImageVerifier>,
    /// Notary signatures and attestations.
    pub notary: Arc<dyn ImageVerifier>,
    /// External API calls.
    pub api: Arc<dyn ApiCaller>,
}

/// Settings shared by every image of a rule.
#[derive(Debug, Clone)]
pub struct VerifySettings {
    /// Per-call timeout.
    pub call_timeout: Duration,
    /// Rekor URL for cosign entries that do not set one.
    pub default_rekor_url: String,
}

/// Why an attestor did not pass.
enum Step {
    /// Counted as a failure of the sub-verification.
    Failure(String),
    /// Stops the image with an ERROR.
    Error(VerificationError),
}

impl From<CapabilityError> for Step {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Verification(msg) => Self::Failure(msg),
            CapabilityError::Operational(msg) => Self::Error(VerificationError::Operational(msg)),
        }
    }
}

impl From<VerificationError> for Step {
    fn from(err: VerificationError) -> Self {
        Self::Error(err)
    }
}

/// Await a capability call, bounded by `limit`.
pub(crate) async fn call_with_timeout<T>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<T, CapabilityError>>,
) -> Result<Result<T, CapabilityError>, VerificationError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| VerificationError::Timeout {
            what: what.to_owned(),
            secs: limit.as_secs(),
        })
}

/// Runs a rule's substituted sub-verifications against images.
pub struct Verifier<'a> {
    capabilities: &'a Capabilities,
    rules: &'a [VerificationRule],
    required: usize,
    settings: &'a VerifySettings,
}

impl<'a> Verifier<'a> {
    /// A verifier for `rules`; `required` of them must pass. Zero means all.
    pub fn new(
        capabilities: &'a Capabilities,
        rules: &'a [VerificationRule],
        required: usize,
        settings: &'a VerifySettings,
    ) -> Self {
        let required = if required == 0 { rules.len() } else { required };
        Self {
            capabilities,
            rules,
            required,
            settings,
        }
    }

    /// Verify one image. `ctx` is the image's own scope.
    pub async fn verify_image(
        &self,
        key: &str,
        image: &ExtractedImage,
        ctx: &mut Context,
    ) -> VerificationResult {
        let reference = image.info.to_string();
        let mut result = VerificationResult {
            image: reference.clone(),
            key: key.to_owned(),
            outcome: VerificationOutcome::Skip,
            error: None,
            responses: Vec::with_capacity(self.rules.len()),
        };
        let (mut passed, mut failed, mut skipped) = (0, 0, 0);

        for entry in self.rules {
            let mut response = VerificationResponse {
                image_references: entry.image_references.clone(),
                skipped: false,
                failures: Vec::new(),
            };

            if !glob::matches_any(&entry.image_references, &reference) {
                debug!(
                    image = %reference,
                    patterns = ?entry.image_references,
                    "image does not match; skipping"
                );
                response.skipped = true;
                skipped += 1;
                result.responses.push(response);
                continue;
            }

            for attestor in entry.attestors() {
                match self.run(attestor, image, ctx).await {
                    Ok(()) => {}
                    Err(Step::Failure(msg)) => {
                        debug!(image = %reference, failure = %msg, "attestor failed");
                        response.failures.push(msg);
                    }
                    Err(Step::Error(err)) => {
                        warn!(image = %reference, error = %err, "verification error");
                        result.responses.push(response);
                        result.outcome = VerificationOutcome::Error;
                        result.error = Some(err.to_string());
                        return result;
                    }
                }
            }

            if response.failures.is_empty() {
                passed += 1;
            } else {
                failed += 1;
            }
            result.responses.push(response);
        }

        result.outcome = quorum(passed, failed, skipped, self.required);
        info!(
            image = %reference,
            passed,
            failed,
            skipped,
            required = self.required,
            outcome = %result.outcome,
            "image verified"
        );
        result
    }

    async fn run(
        &self,
        attestor: Attestor<'_>,
        image: &ExtractedImage,
        ctx: &mut Context,
    ) -> Result<(), Step> {
        match attestor {
            Attestor::Cosign(cosign) => self.cosign(cosign, image, ctx).await,
            Attestor::Notary(notary) => self.notary(notary, image, ctx).await,
            Attestor::ExternalService(external) => self.external(external, image, ctx).await,
        }
    }

    async fn cosign(
        &self,
        cosign: &Cosign,
        image: &ExtractedImage,
        ctx: &mut Context,
    ) -> Result<(), Step> {
        let options = VerifyOptions::cosign(cosign, &image.info, &self.settings.default_rekor_url)
            .map_err(VerificationError::from)?;
        let verifier = &*self.capabilities.cosign;
        self.signature(verifier, &options).await?;
        for attestation in &cosign.intoto_attestations {
            self.attestation(verifier, &options, attestation, ctx).await?;
        }
        Ok(())
    }

    async fn notary(
        &self,
        notary: &Notary,
        image: &ExtractedImage,
        ctx: &mut Context,
    ) -> Result<(), Step> {
        let options = VerifyOptions::notary(notary, &image.info);
        let verifier = &*self.capabilities.notary;
        self.signature(verifier, &options).await?;
        for attestation in &notary.attestations {
            self.attestation(verifier, &options, attestation, ctx).await?;
        }
        Ok(())
    }

    async fn signature(
        &self,
        verifier: &dyn ImageVerifier,
        options: &VerifyOptions,
    ) -> Result<(), Step> {
        call_with_timeout(
            self.settings.call_timeout,
            "signature verification",
            verifier.verify_signature(options),
        )
        .await??;
        Ok(())
    }

    async fn attestation(
        &self,
        verifier: &dyn ImageVerifier,
        options: &VerifyOptions,
        attestation: &Attestation,
        ctx: &mut Context,
    ) -> Result<(), Step> {
        let predicate_type = &attestation.predicate_type;
        let options = options.for_predicate(predicate_type);
        let statements = call_with_timeout(
            self.settings.call_timeout,
            "attestation fetch",
            verifier.fetch_attestations(&options),
        )
        .await??;

        if statements.is_empty() {
            return Err(Step::Failure(format!(
                "no attestations found for {} and predicate {predicate_type}",
                options.image
            )));
        }
        if attestation.conditions.is_empty() {
            return Ok(());
        }

        for (idx, statement) in statements.iter().enumerate() {
            let number = idx + 1;
            let mut scope = ctx.checkpoint();
            let predicate = statement.predicate().ok_or_else(|| {
                Step::Failure(format!(
                    "failed to extract predicate from statement #{number} for {}",
                    options.image
                ))
            })?;
            scope.add_json_object(predicate.clone());

            let outcome = check_conditions(&attestation.conditions, &scope, "attestation")?;
            if !outcome.passed {
                return Err(Step::Failure(format!(
                    "attestation checks failed for {} and predicate {predicate_type} \
                     (statement #{number}): {}",
                    options.image, outcome.message
                )));
            }
        }
        Ok(())
    }

    async fn external(
        &self,
        external: &ExternalService,
        image: &ExtractedImage,
        ctx: &mut Context,
    ) -> Result<(), Step> {
        let call = external.api_call.as_ref().ok_or_else(|| {
            VerificationError::Operational("external service has no api call".to_owned())
        })?;
        let request = ApiRequest::from_call(call)?;
        let body = call_with_timeout(
            self.settings.call_timeout,
            "external service call",
            self.capabilities.api.call(&request),
        )
        .await??;

        let mut data: Value = serde_json::from_slice(&body).map_err(|e| {
            let reason = format!("failed to parse response from {}: {e}", request.url);
            VerificationError::Operational(reason)
        })?;
        if let Some(projection) = call.jmes_path.as_deref().filter(|p| !p.is_empty()) {
            data = expression::search(projection, &data).map_err(VerificationError::from)?;
        }
        let object = match data {
            Value::Object(object) => object,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("response".to_owned(), other);
                wrapped
            }
        };

        let mut scope = ctx.checkpoint();
        scope.add_json_object(object);
        let outcome = check_conditions(&external.conditions, &scope, "verification")?;
        if outcome.passed {
            Ok(())
        } else {
            Err(Step::Failure(format!(
                "verification checks failed for {}: {}",
                image.info, outcome.message
            )))
        }
    }
}

fn check_conditions(
    blocks: &[AnyAllConditions],
    ctx: &Context,
    kind: &str,
) -> Result<conditions::Evaluation, Step> {
    let substituted = substitute_conditions(blocks, ctx).map_err(|e| {
        Step::Failure(format!("failed to substitute variables in {kind} conditions: {e}"))
    })?;
    Ok(conditions::evaluate(&substituted))
}
