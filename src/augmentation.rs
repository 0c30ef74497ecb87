use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::ContactSettings;
use crate::error::CollaboratorError;
use crate::evaluator::QualityEvaluator;
use crate::policy::ConfidencePolicy;
use crate::provider::{LanguageModel, complete_bounded};
use crate::request::{RequestContext, truncate_chars};
use crate::responders::contact_reference;
use crate::safety::{SafetyValidator, SafetyVerdict};
use crate::tracker::PartialResultTracker;

/// Augmentation is allowed only with a usable partial and an unprotected
/// intent.
pub fn is_eligible(tracker: &PartialResultTracker, policy: &ConfidencePolicy, intent: &str) -> bool {
    tracker.has_usable() && !policy.is_protected(intent)
}

#[derive(Debug, Clone, Serialize)]
pub struct AugmentationResult {
    pub answer_text: String,
    pub source_attempt: u32,
    /// Absent when the safety gate failed first.
    pub second_score: Option<f64>,
    pub second_rationale: Option<String>,
    pub safety: SafetyVerdict,
    pub accepted: bool,
}

impl AugmentationResult {
    pub fn rejection_reason(&self, accept_floor: f64) -> Option<String> {
        if self.accepted {
            return None;
        }
        if !self.safety.passed {
            return Some(format!(
                "augmented answer failed safety check: {}",
                self.safety.failure_names().join(", ")
            ));
        }
        match self.second_score {
            Some(score) => Some(format!(
                "second evaluation scored {score:.1} below {accept_floor:.1}"
            )),
            None => Some("second evaluation missing".to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AugmentationFailure {
    #[error("augmentation invariant violated: {reason}")]
    InvariantViolation { reason: String },
    #[error("augmentation generation failed: {0}")]
    Generation(#[source] CollaboratorError),
}

pub struct AugmentationController {
    model: Arc<dyn LanguageModel>,
    evaluator: Arc<QualityEvaluator>,
    safety: SafetyValidator,
    policy: Arc<ConfidencePolicy>,
    contact: ContactSettings,
    timeout: Duration,
    max_documents: usize,
    excerpt_chars: usize,
}

impl AugmentationController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn LanguageModel>,
        evaluator: Arc<QualityEvaluator>,
        safety: SafetyValidator,
        policy: Arc<ConfidencePolicy>,
        contact: ContactSettings,
        timeout: Duration,
        max_documents: usize,
        excerpt_chars: usize,
    ) -> Self {
        Self {
            model,
            evaluator,
            safety,
            policy,
            contact,
            timeout,
            max_documents: max_documents.max(1),
            excerpt_chars: excerpt_chars.max(1),
        }
    }

    pub fn prompt(&self, ctx: &RequestContext, tracker: &PartialResultTracker) -> String {
        let documents = tracker
            .best()
            .map(|attempt| {
                attempt
                    .documents
                    .iter()
                    .take(self.max_documents)
                    .enumerate()
                    .map(|(index, doc)| {
                        format!(
                            "[{}] {}\n{}",
                            index + 1,
                            doc.title,
                            truncate_chars(&doc.full_content, self.excerpt_chars)
                        )
                    })
                    .collect::<Vec<String>>()
                    .join("\n\n")
            })
            .unwrap_or_default();
        let (min_chars, max_chars) = self.safety.bounds();

        format!(
            "The knowledge base only partially answers this customer question.\n\n\
             Question: {}\n\n\
             Knowledge base excerpts:\n{}\n\n\
             Write an answer between {} and {} characters with two sections:\n\
             \"From the knowledge base:\" restating only what the excerpts support, and\n\
             \"Supplemental:\" general guidance that fills the gaps.\n\
             Never contradict the excerpts. Do not invent product names, doses or prices. \
             If supplementing could be unsafe, say so instead of guessing.\n\
             End by telling the customer they can {} for confirmation.",
            ctx.original_query,
            documents,
            min_chars,
            max_chars,
            contact_reference(&self.contact)
        )
    }

    /// Generates, validates and re-scores an augmented answer. Only reached
    /// after `decide` returned `Augment`; anything else is an invariant
    /// violation and escalates.
    pub async fn run(
        &self,
        ctx: &RequestContext,
        tracker: &PartialResultTracker,
    ) -> Result<AugmentationResult, AugmentationFailure> {
        let partial = match tracker.best() {
            Some(partial) if !self.policy.is_protected(&ctx.intent) => partial,
            Some(_) => {
                return Err(self.violation(ctx, "protected intent reached augmentation"));
            }
            None => {
                return Err(self.violation(ctx, "augmentation requested without usable partial"));
            }
        };

        let prompt = self.prompt(ctx, tracker);
        let answer_text =
            complete_bounded(self.model.as_ref(), "augmentation.generate", &prompt, self.timeout)
                .await
                .map_err(|err| {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        error = %err,
                        "augmentation generation failed; escalating"
                    );
                    AugmentationFailure::Generation(err)
                })?;

        let safety = self.safety.validate(&answer_text);
        if !safety.passed {
            tracing::info!(
                request_id = %ctx.request_id,
                failures = ?safety.failure_names(),
                chars = safety.char_count,
                "augmented answer failed safety gate"
            );
            return Ok(AugmentationResult {
                answer_text,
                source_attempt: partial.attempt_index,
                second_score: None,
                second_rationale: None,
                safety,
                accepted: false,
            });
        }

        let second = self
            .evaluator
            .evaluate_augmented(&ctx.original_query, &answer_text, &partial.documents)
            .await;
        let accepted = second.score >= self.policy.augmentation_accept_floor();
        tracing::info!(
            request_id = %ctx.request_id,
            second_score = second.score,
            soft_failure = second.soft_failure,
            accepted,
            "augmented answer evaluated"
        );

        Ok(AugmentationResult {
            answer_text,
            source_attempt: partial.attempt_index,
            second_score: Some(second.score),
            second_rationale: Some(second.rationale),
            safety,
            accepted,
        })
    }

    fn violation(&self, ctx: &RequestContext, reason: &str) -> AugmentationFailure {
        tracing::error!(
            request_id = %ctx.request_id,
            intent = %ctx.intent,
            protected = ctx.protected,
            reason,
            "augmentation invariant violated"
        );
        AugmentationFailure::InvariantViolation {
            reason: reason.to_string(),
        }
    }
}
