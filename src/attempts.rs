use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::augmentation::is_eligible;
use crate::evaluator::QualityEvaluator;
use crate::policy::ConfidencePolicy;
use crate::reformulate::{QueryReformulator, ReformulationRequest, ensure_distinct};
use crate::request::{AttemptRecord, AttemptStatus, EvaluationOutcome, RequestContext};
use crate::retrieval::{SearchService, search_bounded};
use crate::telemetry::TelemetrySink;
use crate::tracker::PartialResultTracker;

/// Outcome for one attempt. Meeting the threshold accepts on any attempt;
/// the last attempt picks between the dosage carve-out, augmentation and
/// escalation in that order.
pub fn decide(
    score: f64,
    attempt_index: u32,
    ctx: &RequestContext,
    policy: &ConfidencePolicy,
    tracker: &PartialResultTracker,
) -> EvaluationOutcome {
    if score >= ctx.threshold {
        return EvaluationOutcome::Accept;
    }
    if attempt_index < policy.max_attempts() {
        return EvaluationOutcome::Continue;
    }
    if policy.has_dosage_fallback(&ctx.intent) {
        return EvaluationOutcome::DosageFallback;
    }
    if is_eligible(tracker, policy, &ctx.intent) {
        return EvaluationOutcome::Augment;
    }
    EvaluationOutcome::Escalate
}

#[derive(Debug)]
pub struct AttemptLoopOutcome {
    pub outcome: EvaluationOutcome,
    pub attempts: Vec<AttemptRecord>,
    pub tracker: PartialResultTracker,
}

impl AttemptLoopOutcome {
    /// The attempt that produced an `Accept`, if any.
    pub fn accepted(&self) -> Option<&AttemptRecord> {
        match self.outcome {
            EvaluationOutcome::Accept => self.attempts.last(),
            _ => None,
        }
    }

    pub fn highest_score(&self) -> f64 {
        self.attempts
            .iter()
            .map(|attempt| attempt.score)
            .fold(0.0, f64::max)
    }
}

pub struct AttemptController {
    search: Arc<dyn SearchService>,
    evaluator: Arc<QualityEvaluator>,
    reformulator: Arc<dyn QueryReformulator>,
    policy: Arc<ConfidencePolicy>,
    top_k: usize,
    search_timeout: Duration,
}

impl AttemptController {
    pub fn new(
        search: Arc<dyn SearchService>,
        evaluator: Arc<QualityEvaluator>,
        reformulator: Arc<dyn QueryReformulator>,
        policy: Arc<ConfidencePolicy>,
        top_k: usize,
        search_timeout: Duration,
    ) -> Self {
        Self {
            search,
            evaluator,
            reformulator,
            policy,
            top_k: top_k.max(1),
            search_timeout,
        }
    }

    pub async fn run(&self, ctx: &RequestContext, telemetry: &TelemetrySink) -> AttemptLoopOutcome {
        let max_attempts = self.policy.max_attempts();
        let mut attempts = Vec::<AttemptRecord>::with_capacity(max_attempts as usize);
        let mut tracker = PartialResultTracker::new(self.policy.usable_partial_floor());

        for attempt_index in 1..=max_attempts {
            let candidate = self
                .reformulator
                .reformulate(&ReformulationRequest {
                    original_query: &ctx.original_query,
                    intent: &ctx.intent,
                    attempt_index,
                    max_attempts,
                    previous: &attempts,
                })
                .await;
            let query = ensure_distinct(&candidate, &ctx.original_query, attempt_index, &attempts);

            let record = self.attempt(ctx, attempt_index, query).await;
            let improved = tracker.observe(&record);
            let outcome = decide(record.score, attempt_index, ctx, &self.policy, &tracker);

            tracing::info!(
                request_id = %ctx.request_id,
                attempt = attempt_index,
                query = %record.query,
                documents = record.documents.len(),
                score = record.score,
                threshold = ctx.threshold,
                outcome = outcome.label(),
                "attempt recorded"
            );
            telemetry.emit(
                "attempt.recorded",
                json!({
                    "request_id": ctx.request_id,
                    "intent": ctx.intent,
                    "attempt_index": attempt_index,
                    "query": record.query,
                    "documents": record.documents.len(),
                    "score": record.score,
                    "status": record.status,
                    "partial_improved": improved,
                    "outcome": outcome.label(),
                }),
            );

            attempts.push(record);
            if outcome.is_terminal() {
                return AttemptLoopOutcome {
                    outcome,
                    attempts,
                    tracker,
                };
            }
        }

        // decide() is terminal on the last index, so this only runs if the
        // policy allowed zero attempts.
        AttemptLoopOutcome {
            outcome: EvaluationOutcome::Escalate,
            attempts,
            tracker,
        }
    }

    async fn attempt(&self, ctx: &RequestContext, attempt_index: u32, query: String) -> AttemptRecord {
        let documents =
            match search_bounded(self.search.as_ref(), &query, self.top_k, self.search_timeout).await
            {
                Ok(documents) => documents,
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        attempt = attempt_index,
                        backend = self.search.backend_name(),
                        error = %err,
                        "search failed; recording empty attempt"
                    );
                    return AttemptRecord {
                        attempt_index,
                        query,
                        documents: Vec::new(),
                        score: 0.0,
                        rationale: format!("search failed: {err}"),
                        status: AttemptStatus::SearchFailed,
                        timestamp: chrono::Utc::now(),
                    };
                }
            };

        if documents.is_empty() {
            return AttemptRecord {
                attempt_index,
                query,
                documents,
                score: 0.0,
                rationale: "no documents retrieved".to_string(),
                status: AttemptStatus::NoDocuments,
                timestamp: chrono::Utc::now(),
            };
        }

        let evaluation = self
            .evaluator
            .evaluate(&ctx.original_query, &documents)
            .await;
        AttemptRecord {
            attempt_index,
            query,
            documents,
            score: evaluation.score,
            rationale: evaluation.rationale,
            status: if evaluation.soft_failure {
                AttemptStatus::EvaluationFallback
            } else {
                AttemptStatus::Evaluated
            },
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Document;

    fn ctx(intent: &str, policy: &ConfidencePolicy) -> RequestContext {
        RequestContext::new("req".to_string(), "question", intent, policy)
    }

    fn record(index: u32, score: f64) -> AttemptRecord {
        AttemptRecord {
            attempt_index: index,
            query: format!("q{index}"),
            documents: vec![Document {
                title: "t".to_string(),
                full_content: "body".to_string(),
                content_type: String::new(),
                url: String::new(),
                relevance: 1.0,
            }],
            score,
            rationale: String::new(),
            status: AttemptStatus::Evaluated,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn threshold_equality_accepts_on_any_attempt() {
        let policy = ConfidencePolicy::default();
        let tracker = PartialResultTracker::new(5.0);
        let general = ctx("general", &policy);
        assert_eq!(decide(7.0, 1, &general, &policy, &tracker), EvaluationOutcome::Accept);
        assert_eq!(decide(6.9, 1, &general, &policy, &tracker), EvaluationOutcome::Continue);
        assert_eq!(decide(9.0, 3, &general, &policy, &tracker), EvaluationOutcome::Accept);
    }

    #[test]
    fn last_attempt_prefers_dosage_then_augment_then_escalate() {
        let policy = ConfidencePolicy::default();
        let mut tracker = PartialResultTracker::new(5.0);
        tracker.observe(&record(2, 5.5));

        let dosage = ctx("dosage", &policy);
        assert_eq!(
            decide(5.0, 3, &dosage, &policy, &tracker),
            EvaluationOutcome::DosageFallback
        );

        let general = ctx("general", &policy);
        assert_eq!(decide(4.0, 3, &general, &policy, &tracker), EvaluationOutcome::Augment);

        let business = ctx("business", &policy);
        assert_eq!(decide(8.0, 3, &business, &policy, &tracker), EvaluationOutcome::Escalate);

        let empty = PartialResultTracker::new(5.0);
        assert_eq!(decide(4.0, 3, &general, &policy, &empty), EvaluationOutcome::Escalate);
    }

    #[test]
    fn augment_is_never_decided_for_protected_intents() {
        let policy = ConfidencePolicy::default();
        let mut tracker = PartialResultTracker::new(5.0);
        tracker.observe(&record(1, 6.9));
        for intent in policy.protected_intents().clone() {
            let context = ctx(&intent, &policy);
            for score in [0.0, 3.0, 5.0, 6.0, 6.5] {
                let outcome = decide(score, policy.max_attempts(), &context, &policy, &tracker);
                assert_ne!(outcome, EvaluationOutcome::Augment, "intent {intent}");
            }
        }
    }
}
