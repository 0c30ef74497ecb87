use crate::augmentation::AugmentationResult;
use crate::intent::BusinessKind;
use crate::request::{AttemptRecord, FinalAnswer, Provenance, RequestContext};
use crate::responders::{
    DOSAGE_FALLBACK_CONFIDENCE, DOSAGE_FALLBACK_REASON, PARTNERSHIP_CONFIDENCE,
    TECHNICAL_SUPPORT_CONFIDENCE, TRADE_SECRET_CONFIDENCE, Templates,
};

/// How a request ended.
#[derive(Debug, Clone)]
pub enum Terminal {
    Accepted { answer_text: String, score: f64 },
    Augmented(AugmentationResult),
    Escalated { reason: String },
    DosageFallback,
    Business(BusinessKind),
    TradeSecret,
}

impl Terminal {
    pub fn label(&self) -> &'static str {
        match self {
            Terminal::Accepted { .. } => "accepted",
            Terminal::Augmented(_) => "augmented",
            Terminal::Escalated { .. } => "escalated",
            Terminal::DosageFallback => "dosage_fallback",
            Terminal::Business(_) => "business",
            Terminal::TradeSecret => "trade_secret",
        }
    }
}

fn highest_score(attempts: &[AttemptRecord]) -> f64 {
    attempts
        .iter()
        .map(|attempt| attempt.score)
        .fold(0.0, f64::max)
}

fn escalated(
    reason: String,
    ctx: &RequestContext,
    attempts: Vec<AttemptRecord>,
    templates: &Templates,
) -> FinalAnswer {
    FinalAnswer {
        request_id: ctx.request_id.clone(),
        answer_text: templates.escalation(),
        confidence: highest_score(&attempts),
        provenance: Provenance::Escalated,
        intent: ctx.intent.clone(),
        attempts,
        escalation_reason: Some(reason),
    }
}

/// Builds the one answer a request returns. An augmented result that was
/// not accepted, or that reached here for a protected intent, escalates.
pub fn finalize(
    terminal: Terminal,
    ctx: &RequestContext,
    attempts: Vec<AttemptRecord>,
    templates: &Templates,
) -> FinalAnswer {
    let (answer_text, confidence, provenance) = match terminal {
        Terminal::Accepted { answer_text, score } => (answer_text, score, Provenance::Direct),
        Terminal::Augmented(result) => {
            let second_score = match result.second_score {
                Some(score) if result.accepted && result.safety.passed && !ctx.protected => score,
                _ => {
                    let reason = "augmented answer was not accepted".to_string();
                    return escalated(reason, ctx, attempts, templates);
                }
            };
            (result.answer_text, second_score, Provenance::Augmented)
        }
        Terminal::Escalated { reason } => return escalated(reason, ctx, attempts, templates),
        // Packaging referral replaces the generic escalation text but keeps
        // the escalated provenance.
        Terminal::DosageFallback => {
            return FinalAnswer {
                request_id: ctx.request_id.clone(),
                answer_text: templates.dosage_fallback(),
                confidence: DOSAGE_FALLBACK_CONFIDENCE,
                provenance: Provenance::Escalated,
                intent: ctx.intent.clone(),
                attempts,
                escalation_reason: Some(DOSAGE_FALLBACK_REASON.to_string()),
            };
        }
        Terminal::Business(kind) => {
            let confidence = match kind {
                BusinessKind::Partnership => PARTNERSHIP_CONFIDENCE,
                BusinessKind::TechnicalSupport => TECHNICAL_SUPPORT_CONFIDENCE,
            };
            (templates.business(kind), confidence, Provenance::Business)
        }
        Terminal::TradeSecret => (
            templates.trade_secret(),
            TRADE_SECRET_CONFIDENCE,
            Provenance::TradeSecret,
        ),
    };

    FinalAnswer {
        request_id: ctx.request_id.clone(),
        answer_text,
        confidence,
        provenance,
        intent: ctx.intent.clone(),
        attempts,
        escalation_reason: None,
    }
}
