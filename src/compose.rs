use std::sync::Arc;
use std::time::Duration;

use crate::error::CollaboratorError;
use crate::provider::{LanguageModel, complete_bounded};
use crate::request::{AttemptRecord, Document, RequestContext};

pub const COMPOSE_MAX_DOCUMENTS: usize = 3;
pub const MAX_PRODUCT_LINKS: usize = 3;

/// `title: url` lines for product documents among the first sources.
pub fn product_links(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .take(COMPOSE_MAX_DOCUMENTS)
        .filter(|doc| doc.content_type.eq_ignore_ascii_case("product") && !doc.url.trim().is_empty())
        .take(MAX_PRODUCT_LINKS)
        .map(|doc| format!("- {}: {}", doc.title, doc.url.trim()))
        .collect()
}

/// Writes the direct answer for an accepted attempt, using only the
/// retrieved documents.
pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    company_name: String,
    domain_description: Option<String>,
}

impl AnswerComposer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        timeout: Duration,
        company_name: String,
        domain_description: Option<String>,
    ) -> Self {
        Self {
            model,
            timeout,
            company_name,
            domain_description,
        }
    }

    pub fn prompt(&self, ctx: &RequestContext, attempt: &AttemptRecord) -> String {
        let sources = attempt
            .documents
            .iter()
            .take(COMPOSE_MAX_DOCUMENTS)
            .enumerate()
            .map(|(index, doc)| {
                let kind = if doc.content_type.is_empty() {
                    "unknown"
                } else {
                    doc.content_type.as_str()
                };
                format!(
                    "--- SOURCE {} ---\nTitle: {}\nType: {}\nContent: {}",
                    index + 1,
                    doc.title,
                    kind,
                    doc.full_content
                )
            })
            .collect::<Vec<String>>()
            .join("\n\n");

        format!(
            "You are a customer assistant for {}.\n\
             {}\
             Verified sources (confidence {:.1}/10 after {} attempt(s), intent {}):\n\n{}\n\n\
             Customer question: \"{}\"\n\n\
             Answer using only facts from the sources. Do not add outside knowledge. \
             Be practical and give concrete steps, doses or parameters when the sources do.",
            self.company_name,
            self.domain_description
                .as_deref()
                .map(|description| format!("Domain: {description}\n"))
                .unwrap_or_default(),
            attempt.score,
            attempt.attempt_index,
            ctx.intent,
            sources,
            ctx.original_query
        )
    }

    pub async fn compose(
        &self,
        ctx: &RequestContext,
        attempt: &AttemptRecord,
    ) -> Result<String, CollaboratorError> {
        let prompt = self.prompt(ctx, attempt);
        let mut answer =
            complete_bounded(self.model.as_ref(), "compose.answer", &prompt, self.timeout).await?;

        let links = product_links(&attempt.documents);
        if !links.is_empty() {
            answer.push_str("\n\nProducts:\n");
            answer.push_str(&links.join("\n"));
        }
        Ok(answer)
    }
}
