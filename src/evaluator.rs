use std::sync::Arc;
use std::time::Duration;

use winnow::ascii::{Caseless, digit1, space0};
use winnow::combinator::{eof, opt};
use winnow::error::ModalResult;
use winnow::prelude::*;
use winnow::token::one_of;

use crate::provider::{LanguageModel, complete_bounded};
use crate::request::{Document, truncate_chars};

/// Score used when the model output cannot be trusted.
pub const EVALUATION_FALLBACK_SCORE: f64 = 3.0;
pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub rationale: String,
    pub soft_failure: bool,
}

impl Evaluation {
    fn fallback(reason: String) -> Self {
        Self {
            score: EVALUATION_FALLBACK_SCORE,
            rationale: reason,
            soft_failure: true,
        }
    }
}

fn confidence_value(input: &mut &str) -> ModalResult<f64> {
    (space0, Caseless("confidence"), space0, ':', space0).parse_next(input)?;
    let value = (digit1, opt(('.', one_of('0'..='9'))))
        .take()
        .try_map(str::parse::<f64>)
        .parse_next(input)?;
    opt((space0, '/', space0, "10")).parse_next(input)?;
    (space0, eof).parse_next(input)?;
    Ok(value)
}

/// Extracts the single `CONFIDENCE: n` value from a scoring response.
///
/// Every `confidence:` line must parse cleanly; conflicting values or
/// anything outside 1..=10 yields `None`. Prose that merely mentions the
/// word is ignored.
pub fn parse_confidence(response: &str) -> Option<f64> {
    let mut found: Option<f64> = None;
    for line in response.lines() {
        let trimmed = line.trim();
        if !is_confidence_line(trimmed) {
            continue;
        }
        let mut input = trimmed;
        let value = confidence_value.parse_next(&mut input).ok()?;
        match found {
            Some(previous) if (previous - value).abs() > f64::EPSILON => return None,
            _ => found = Some(value),
        }
    }
    found.filter(|value| (MIN_SCORE..=MAX_SCORE).contains(value))
}

fn is_confidence_line(line: &str) -> bool {
    let keyword = "confidence";
    line.get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
        && line[keyword.len()..].trim_start().starts_with(':')
}

pub fn parse_reasoning(response: &str) -> Option<String> {
    let lower = response.to_ascii_lowercase();
    let start = lower.find("reasoning:")? + "reasoning:".len();
    let text = response.get(start..)?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Scores retrieved evidence (and augmented answers) with the language model.
pub struct QualityEvaluator {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_documents: usize,
    excerpt_chars: usize,
    domain_description: Option<String>,
}

impl QualityEvaluator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        timeout: Duration,
        max_documents: usize,
        excerpt_chars: usize,
        domain_description: Option<String>,
    ) -> Self {
        Self {
            model,
            timeout,
            max_documents: max_documents.max(1),
            excerpt_chars: excerpt_chars.max(1),
            domain_description,
        }
    }

    fn render_documents(&self, documents: &[Document]) -> String {
        if documents.is_empty() {
            return "(no documents)".to_string();
        }
        documents
            .iter()
            .take(self.max_documents)
            .enumerate()
            .map(|(index, doc)| {
                format!(
                    "Document {}: {}\n{}",
                    index + 1,
                    doc.title,
                    truncate_chars(&doc.full_content, self.excerpt_chars)
                )
            })
            .collect::<Vec<String>>()
            .join("\n\n")
    }

    fn domain_line(&self) -> String {
        self.domain_description
            .as_deref()
            .map(|description| format!("Domain: {description}\n"))
            .unwrap_or_default()
    }

    pub fn retrieval_prompt(&self, query: &str, documents: &[Document]) -> String {
        format!(
            "You are grading how well retrieved documents answer a user question.\n\
             {}\
             Question: {query}\n\n\
             Retrieved documents:\n{}\n\n\
             Rate from 1 to 10 how completely and accurately these documents answer the question.\n\
             Reply in exactly this format:\n\
             CONFIDENCE: <number from 1 to 10>\n\
             REASONING: <one or two sentences>",
            self.domain_line(),
            self.render_documents(documents)
        )
    }

    pub fn augmented_prompt(&self, query: &str, answer: &str, documents: &[Document]) -> String {
        format!(
            "You are reviewing a drafted answer before it reaches a customer.\n\
             {}\
             Question: {query}\n\n\
             Source documents:\n{}\n\n\
             Drafted answer:\n{answer}\n\n\
             Rate from 1 to 10 whether the answer is faithful to the documents, accurate, \
             safe and actionable. Penalize unsupported claims.\n\
             Reply in exactly this format:\n\
             CONFIDENCE: <number from 1 to 10>\n\
             REASONING: <one or two sentences>",
            self.domain_line(),
            self.render_documents(documents)
        )
    }

    /// Grades evidence for the original query. No documents means no
    /// evidence, scored 0.0 without a model call.
    pub async fn evaluate(&self, query: &str, documents: &[Document]) -> Evaluation {
        if documents.is_empty() {
            return Evaluation {
                score: 0.0,
                rationale: "no documents retrieved".to_string(),
                soft_failure: false,
            };
        }
        let prompt = self.retrieval_prompt(query, documents);
        self.score("evaluator.retrieval", &prompt).await
    }

    pub async fn evaluate_augmented(
        &self,
        query: &str,
        answer: &str,
        documents: &[Document],
    ) -> Evaluation {
        let prompt = self.augmented_prompt(query, answer, documents);
        self.score("evaluator.augmented", &prompt).await
    }

    async fn score(&self, operation: &'static str, prompt: &str) -> Evaluation {
        let response =
            match complete_bounded(self.model.as_ref(), operation, prompt, self.timeout).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        operation,
                        error = %err,
                        fallback = EVALUATION_FALLBACK_SCORE,
                        "evaluation call failed; using conservative score"
                    );
                    return Evaluation::fallback(format!("evaluation unavailable: {err}"));
                }
            };

        match parse_confidence(&response) {
            Some(score) => Evaluation {
                score,
                rationale: parse_reasoning(&response)
                    .unwrap_or_else(|| truncate_chars(&response, 300)),
                soft_failure: false,
            },
            None => {
                tracing::warn!(
                    operation,
                    response = %truncate_chars(&response, 200),
                    fallback = EVALUATION_FALLBACK_SCORE,
                    "unparseable confidence in evaluation response"
                );
                Evaluation::fallback("evaluation response had no valid confidence".to_string())
            }
        }
    }
}
