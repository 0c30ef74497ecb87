use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::cli::SearchBackend;
use crate::config::RuntimeConfig;
use crate::error::CollaboratorError;
use crate::provider::with_timeout;
use crate::request::Document;

/// Ranked document search. Ranking and relevance metadata belong to the
/// backend; the quality loop scores documents itself.
#[async_trait]
pub trait SearchService: Send + Sync {
    fn backend_name(&self) -> &'static str;
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<Document>, CollaboratorError>;
}

pub async fn search_bounded(
    search: &dyn SearchService,
    query: &str,
    top_k: usize,
    timeout: Duration,
) -> std::result::Result<Vec<Document>, CollaboratorError> {
    with_timeout("search", timeout, search.search(query, top_k)).await
}

pub struct DisabledSearch;

#[async_trait]
impl SearchService for DisabledSearch {
    fn backend_name(&self) -> &'static str {
        "disabled"
    }

    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
    ) -> std::result::Result<Vec<Document>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct CorpusEntry {
    title: String,
    #[serde(alias = "content", alias = "text")]
    full_content: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    url: String,
}

/// Reads a corpus file: either a JSON array of documents or plain text split
/// on blank lines, where the first line of each block is its title.
pub fn load_corpus(path: &str) -> Result<Vec<Document>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus at '{}'", path))?;
    parse_corpus(&content, path)
}

pub fn parse_corpus(content: &str, origin: &str) -> Result<Vec<Document>> {
    if content.trim_start().starts_with('[') {
        let entries = serde_json::from_str::<Vec<CorpusEntry>>(content)
            .with_context(|| format!("invalid JSON corpus in '{}'", origin))?;
        return Ok(entries
            .into_iter()
            .filter(|entry| !entry.full_content.trim().is_empty())
            .map(|entry| Document {
                title: entry.title,
                full_content: entry.full_content,
                content_type: entry.content_type,
                url: entry.url,
                relevance: 0.0,
            })
            .collect());
    }

    let content = content.replace("\r\n", "\n");
    let documents = content
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .enumerate()
        .map(|(index, block)| {
            let (title, body) = match block.split_once('\n') {
                Some((title, rest)) if !rest.trim().is_empty() => (title.trim(), rest.trim()),
                _ => ("", block),
            };
            let title = if title.is_empty() {
                format!("{origin}#{}", index + 1)
            } else {
                title.to_string()
            };
            Document {
                title,
                full_content: body.to_string(),
                content_type: "article".to_string(),
                url: String::new(),
                relevance: 0.0,
            }
        })
        .collect::<Vec<Document>>();
    Ok(documents)
}

pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2)
        .collect::<Vec<String>>()
}

fn lexical_hits(terms: &[String], document: &Document) -> usize {
    let title = document.title.to_lowercase();
    let body = document.full_content.to_lowercase();
    terms
        .iter()
        .map(|term| body.matches(term.as_str()).count() + 2 * title.matches(term.as_str()).count())
        .sum::<usize>()
}

fn rank(mut scored: Vec<(usize, Document)>, top_k: usize) -> Vec<Document> {
    scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
    scored.truncate(top_k.max(1));
    let best = scored.first().map(|(score, _)| *score).unwrap_or(1).max(1) as f64;
    scored
        .into_iter()
        .map(|(score, mut document)| {
            document.relevance = score as f64 / best;
            document
        })
        .collect()
}

pub struct LocalCorpusSearch {
    pub documents: Vec<Document>,
}

impl LocalCorpusSearch {
    pub fn load(path: &str) -> Result<Self> {
        Ok(Self {
            documents: load_corpus(path)?,
        })
    }
}

#[async_trait]
impl SearchService for LocalCorpusSearch {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<Document>, CollaboratorError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let scored = self
            .documents
            .iter()
            .filter_map(|document| {
                let hits = lexical_hits(&terms, document);
                (hits > 0).then(|| (hits, document.clone()))
            })
            .collect::<Vec<(usize, Document)>>();
        Ok(rank(scored, top_k))
    }
}

#[cfg(feature = "semantic-search")]
pub struct SemanticCorpusSearch {
    pub documents: Vec<Document>,
}

#[cfg(feature = "semantic-search")]
impl SemanticCorpusSearch {
    pub fn load(path: &str) -> Result<Self> {
        Ok(Self {
            documents: load_corpus(path)?,
        })
    }
}

#[cfg(feature = "semantic-search")]
#[async_trait]
impl SearchService for SemanticCorpusSearch {
    fn backend_name(&self) -> &'static str {
        "semantic"
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> std::result::Result<Vec<Document>, CollaboratorError> {
        let query_lower = query.trim().to_lowercase();
        if query_lower.is_empty() {
            return Ok(Vec::new());
        }
        let terms = query_terms(query);

        let scored = self
            .documents
            .iter()
            .filter_map(|document| {
                let body = document.full_content.to_lowercase();
                let similarity = strsim::jaro_winkler(&query_lower, &body);
                let hits = lexical_hits(&terms, document);
                let score = ((similarity * 1000.0) as usize) + (hits * 25);
                (score > 0).then(|| (score, document.clone()))
            })
            .collect::<Vec<(usize, Document)>>();
        Ok(rank(scored, top_k))
    }
}

pub fn build_search_service(cfg: &RuntimeConfig) -> Result<Arc<dyn SearchService>> {
    match cfg.search_backend {
        SearchBackend::Disabled => Ok(Arc::new(DisabledSearch)),
        SearchBackend::Local => {
            let path = cfg.corpus_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "search backend 'local' requires --corpus-path or profile.corpus_path"
                )
            })?;
            let service = LocalCorpusSearch::load(path)?;
            tracing::info!(
                documents = service.documents.len(),
                path,
                "loaded local corpus"
            );
            Ok(Arc::new(service))
        }
        SearchBackend::Semantic => {
            let path = cfg.corpus_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "search backend 'semantic' requires --corpus-path or profile.corpus_path"
                )
            })?;

            #[cfg(feature = "semantic-search")]
            {
                let service = SemanticCorpusSearch::load(path)?;
                Ok(Arc::new(service))
            }

            #[cfg(not(feature = "semantic-search"))]
            {
                let _ = path;
                Err(anyhow::anyhow!(
                    "search backend 'semantic' requires feature 'semantic-search'. Rebuild with: cargo run --features semantic-search -- ..."
                ))
            }
        }
    }
}
