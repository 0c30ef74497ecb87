use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde_json::json;

use crate::attempts::{AttemptController, AttemptLoopOutcome};
use crate::augmentation::{AugmentationController, AugmentationFailure};
use crate::cli::ReformulationStrategy;
use crate::compose::AnswerComposer;
use crate::config::RuntimeConfig;
use crate::evaluator::QualityEvaluator;
use crate::finalize::{Terminal, finalize};
use crate::intent::{IntentAnalysis, IntentClassifier, Route};
use crate::policy::ConfidencePolicy;
use crate::provider::LanguageModel;
use crate::reformulate::{ModelReformulator, QueryReformulator, RuleReformulator};
use crate::request::{AttemptRecord, EvaluationOutcome, FinalAnswer, RequestContext};
use crate::responders::Templates;
use crate::retrieval::SearchService;
use crate::telemetry::{TelemetrySink, unix_ms_now};

/// Per-request states. Each step consumes the previous one; nothing is
/// shared between requests.
enum Step {
    Classify,
    Route(IntentAnalysis),
    Retrieve(RequestContext),
    Resolve(RequestContext, AttemptLoopOutcome),
    Finalize(RequestContext, Terminal, Vec<AttemptRecord>),
}

/// Immutable after construction; share it behind `Arc` across requests.
pub struct AnswerWorkflow {
    policy: Arc<ConfidencePolicy>,
    classifier: IntentClassifier,
    attempts: AttemptController,
    augmentation: AugmentationController,
    composer: AnswerComposer,
    templates: Templates,
    telemetry: TelemetrySink,
    max_query_chars: usize,
    request_seq: AtomicU64,
}

impl AnswerWorkflow {
    pub fn build(
        cfg: &RuntimeConfig,
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn SearchService>,
        telemetry: TelemetrySink,
    ) -> Self {
        let policy = Arc::new(cfg.confidence_policy());
        let evaluator = Arc::new(QualityEvaluator::new(
            model.clone(),
            cfg.model_timeout(),
            cfg.eval_max_documents,
            cfg.eval_excerpt_chars,
            cfg.domain_description.clone(),
        ));

        let rules = RuleReformulator::new(cfg.topics.clone(), cfg.domain_terms.clone());
        let reformulator: Arc<dyn QueryReformulator> = match cfg.reformulation {
            ReformulationStrategy::Rules => Arc::new(rules),
            ReformulationStrategy::Model => Arc::new(ModelReformulator::new(
                model.clone(),
                cfg.model_timeout(),
                cfg.domain_terms.clone(),
                cfg.domain_description.clone(),
                rules,
            )),
        };

        let classifier = if cfg.intent_model_refinement {
            IntentClassifier::with_model_refinement(model.clone(), cfg.model_timeout())
        } else {
            IntentClassifier::patterns_only()
        };

        Self {
            attempts: AttemptController::new(
                search,
                evaluator.clone(),
                reformulator,
                policy.clone(),
                cfg.search_top_k,
                cfg.search_timeout(),
            ),
            augmentation: AugmentationController::new(
                model.clone(),
                evaluator,
                cfg.safety_validator(),
                policy.clone(),
                cfg.contact.clone(),
                cfg.model_timeout(),
                cfg.augmentation_max_documents,
                cfg.augmentation_excerpt_chars,
            ),
            composer: AnswerComposer::new(
                model,
                cfg.model_timeout(),
                cfg.contact.company_name.clone(),
                cfg.domain_description.clone(),
            ),
            templates: Templates::new(cfg.contact.clone()),
            classifier,
            policy,
            telemetry,
            max_query_chars: cfg.max_query_chars,
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{seq}", unix_ms_now())
    }

    /// Answers one question. Errors only for unusable input; every other
    /// failure ends in an escalated answer.
    pub async fn answer(&self, query: &str, intent_hint: Option<&str>) -> Result<FinalAnswer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(anyhow::anyhow!("query cannot be empty"));
        }
        let query_chars = query.chars().count();
        if query_chars > self.max_query_chars {
            return Err(anyhow::anyhow!(
                "query is {} characters; the limit is {}",
                query_chars,
                self.max_query_chars
            ));
        }

        let mut step = Step::Classify;
        loop {
            step = match step {
                Step::Classify => {
                    let analysis = match intent_hint.map(str::trim).filter(|hint| !hint.is_empty())
                    {
                        Some(hint) => IntentAnalysis::explicit(hint),
                        None => self.classifier.classify(query).await,
                    };
                    Step::Route(analysis)
                }
                Step::Route(analysis) => {
                    let ctx = RequestContext::new(
                        self.next_request_id(),
                        query,
                        &analysis.intent,
                        &self.policy,
                    );
                    tracing::info!(
                        request_id = %ctx.request_id,
                        intent = %ctx.intent,
                        source = ?analysis.source,
                        threshold = ctx.threshold,
                        protected = ctx.protected,
                        "request classified"
                    );
                    match analysis.route() {
                        Route::Business(kind) => {
                            Step::Finalize(ctx, Terminal::Business(kind), Vec::new())
                        }
                        Route::TradeSecret => Step::Finalize(ctx, Terminal::TradeSecret, Vec::new()),
                        Route::Retrieval => Step::Retrieve(ctx),
                    }
                }
                Step::Retrieve(ctx) => {
                    let outcome = self.attempts.run(&ctx, &self.telemetry).await;
                    Step::Resolve(ctx, outcome)
                }
                Step::Resolve(ctx, outcome) => {
                    let terminal = self.resolve(&ctx, &outcome).await;
                    Step::Finalize(ctx, terminal, outcome.attempts)
                }
                Step::Finalize(ctx, terminal, attempts) => {
                    let label = terminal.label();
                    let answer = finalize(terminal, &ctx, attempts, &self.templates);
                    self.record_completion(&answer, label);
                    return Ok(answer);
                }
            };
        }
    }

    async fn resolve(&self, ctx: &RequestContext, outcome: &AttemptLoopOutcome) -> Terminal {
        match outcome.outcome {
            EvaluationOutcome::Accept => {
                let Some(accepted) = outcome.accepted() else {
                    return Terminal::Escalated {
                        reason: "accepted outcome without an attempt".to_string(),
                    };
                };
                match self.composer.compose(ctx, accepted).await {
                    Ok(answer_text) => Terminal::Accepted {
                        answer_text,
                        score: accepted.score,
                    },
                    Err(err) => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            error = %err,
                            "answer composition failed; escalating"
                        );
                        Terminal::Escalated {
                            reason: format!("answer composition failed: {err}"),
                        }
                    }
                }
            }
            EvaluationOutcome::DosageFallback => Terminal::DosageFallback,
            EvaluationOutcome::Augment => self.augment(ctx, outcome).await,
            EvaluationOutcome::Escalate | EvaluationOutcome::Continue => {
                let reason = if ctx.protected && outcome.tracker.has_usable() {
                    format!(
                        "best score {:.1} below threshold {:.1}; intent '{}' is protected from augmentation",
                        outcome.highest_score(),
                        ctx.threshold,
                        ctx.intent
                    )
                } else {
                    format!(
                        "no attempt reached threshold {:.1} (best {:.1}) and no usable partial result",
                        ctx.threshold,
                        outcome.highest_score()
                    )
                };
                Terminal::Escalated { reason }
            }
        }
    }

    async fn augment(&self, ctx: &RequestContext, outcome: &AttemptLoopOutcome) -> Terminal {
        match self.augmentation.run(ctx, &outcome.tracker).await {
            Ok(result) if result.accepted => {
                self.telemetry.emit(
                    "augmentation.accepted",
                    json!({
                        "request_id": ctx.request_id,
                        "intent": ctx.intent,
                        "source_attempt": result.source_attempt,
                        "second_score": result.second_score,
                        "chars": result.safety.char_count,
                    }),
                );
                Terminal::Augmented(result)
            }
            Ok(result) => {
                let reason = result
                    .rejection_reason(self.policy.augmentation_accept_floor())
                    .unwrap_or_else(|| "augmented answer rejected".to_string());
                tracing::info!(request_id = %ctx.request_id, reason = %reason, "augmentation rejected");
                self.telemetry.emit(
                    "augmentation.rejected",
                    json!({
                        "request_id": ctx.request_id,
                        "intent": ctx.intent,
                        "second_score": result.second_score,
                        "safety_failures": result.safety.failure_names(),
                        "reason": reason,
                    }),
                );
                Terminal::Escalated { reason }
            }
            Err(err @ AugmentationFailure::InvariantViolation { .. }) => {
                self.telemetry.emit(
                    "invariant.violated",
                    json!({
                        "request_id": ctx.request_id,
                        "intent": ctx.intent,
                        "error": err.to_string(),
                    }),
                );
                Terminal::Escalated {
                    reason: err.to_string(),
                }
            }
            Err(err @ AugmentationFailure::Generation(_)) => {
                self.telemetry.emit(
                    "augmentation.rejected",
                    json!({
                        "request_id": ctx.request_id,
                        "intent": ctx.intent,
                        "reason": err.to_string(),
                    }),
                );
                Terminal::Escalated {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn record_completion(&self, answer: &FinalAnswer, terminal: &str) {
        tracing::info!(
            request_id = %answer.request_id,
            intent = %answer.intent,
            provenance = answer.provenance.label(),
            confidence = answer.confidence,
            attempts = answer.attempts.len(),
            terminal,
            "request completed"
        );
        self.telemetry.emit(
            "request.completed",
            json!({
                "request_id": answer.request_id,
                "intent": answer.intent,
                "provenance": answer.provenance.label(),
                "confidence": answer.confidence,
                "attempts": answer.attempts.len(),
                "escalation_reason": answer.escalation_reason,
                "terminal": terminal,
            }),
        );
    }
}
