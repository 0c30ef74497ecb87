use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::ConfidencePolicy;

/// A ranked search hit. `relevance` is whatever the backend reported; the
/// quality loop never scores with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub full_content: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub relevance: f64,
}

impl Document {
    pub fn excerpt(&self, max_chars: usize) -> String {
        truncate_chars(&self.full_content, max_chars)
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub original_query: String,
    pub intent: String,
    pub threshold: f64,
    pub protected: bool,
}

impl RequestContext {
    pub fn new(request_id: String, query: &str, intent: &str, policy: &ConfidencePolicy) -> Self {
        let intent = crate::policy::normalize_intent(intent);
        let intent = if intent.is_empty() {
            "general".to_string()
        } else {
            intent
        };
        Self {
            request_id,
            original_query: query.trim().to_string(),
            threshold: policy.threshold_for(&intent),
            protected: policy.is_protected(&intent),
            intent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Evaluated,
    EvaluationFallback,
    NoDocuments,
    SearchFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_index: u32,
    pub query: String,
    pub documents: Vec<Document>,
    pub score: f64,
    pub rationale: String,
    pub status: AttemptStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptSummary {
    pub attempt_index: u32,
    pub query_used: String,
    pub score: f64,
}

impl From<&AttemptRecord> for AttemptSummary {
    fn from(record: &AttemptRecord) -> Self {
        Self {
            attempt_index: record.attempt_index,
            query_used: record.query.clone(),
            score: record.score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationOutcome {
    Continue,
    Accept,
    Escalate,
    Augment,
    /// Dedicated deterministic responder for intents with a packaging-label
    /// fallback; never augmentation.
    DosageFallback,
}

impl EvaluationOutcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EvaluationOutcome::Continue)
    }

    pub fn label(self) -> &'static str {
        match self {
            EvaluationOutcome::Continue => "continue",
            EvaluationOutcome::Accept => "accept",
            EvaluationOutcome::Escalate => "escalate",
            EvaluationOutcome::Augment => "augment",
            EvaluationOutcome::DosageFallback => "dosage_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Direct,
    Augmented,
    Escalated,
    Business,
    TradeSecret,
}

impl Provenance {
    pub fn label(self) -> &'static str {
        match self {
            Provenance::Direct => "direct",
            Provenance::Augmented => "augmented",
            Provenance::Escalated => "escalated",
            Provenance::Business => "business",
            Provenance::TradeSecret => "trade_secret",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalAnswer {
    pub request_id: String,
    pub answer_text: String,
    pub confidence: f64,
    pub provenance: Provenance,
    pub intent: String,
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

impl FinalAnswer {
    pub fn audit_trail(&self) -> Vec<AttemptSummary> {
        self.attempts.iter().map(AttemptSummary::from).collect()
    }

    pub fn view(&self) -> AnswerView {
        AnswerView {
            request_id: self.request_id.clone(),
            answer_text: self.answer_text.clone(),
            confidence: self.confidence,
            provenance: self.provenance,
            intent: self.intent.clone(),
            attempts: self.audit_trail(),
            escalation_reason: self.escalation_reason.clone(),
        }
    }
}

/// External shape of a final answer; documents stay internal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerView {
    pub request_id: String,
    pub answer_text: String,
    pub confidence: f64,
    pub provenance: Provenance,
    pub intent: String,
    pub attempts: Vec<AttemptSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_multibyte_boundaries() {
        assert_eq!(truncate_chars("żółw morski", 4), "żółw...");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn request_context_normalizes_intent_and_reads_policy() {
        let policy = ConfidencePolicy::default();
        let ctx = RequestContext::new("req-1".to_string(), "  dose?  ", " Dosage ", &policy);
        assert_eq!(ctx.intent, "dosage");
        assert_eq!(ctx.original_query, "dose?");
        assert_eq!(ctx.threshold, 6.0);
        assert!(ctx.protected);

        let blank = RequestContext::new("req-2".to_string(), "q", "   ", &policy);
        assert_eq!(blank.intent, "general");
        assert!(!blank.protected);
    }

    #[test]
    fn provenance_serializes_snake_case() {
        let encoded = serde_json::to_string(&Provenance::TradeSecret).unwrap();
        assert_eq!(encoded, "\"trade_secret\"");
    }
}
