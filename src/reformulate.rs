use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::{LanguageModel, complete_bounded};
use crate::request::{AttemptRecord, truncate_chars};

pub const MAX_REFORMULATED_WORDS: usize = 10;
pub const MIN_REFORMULATED_WORDS: usize = 2;

/// Keyword tiers for one topic. `triggers` match whole query words by
/// prefix, or anywhere in the query when they contain a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopicRule {
    pub name: String,
    pub triggers: Vec<String>,
    pub focused: String,
    pub broadened: String,
    pub category: String,
}

impl TopicRule {
    pub fn matches(&self, query: &str) -> bool {
        let lower = query.to_lowercase();
        let words = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect::<Vec<&str>>();
        self.triggers.iter().any(|trigger| {
            let trigger = trigger.trim().to_lowercase();
            if trigger.is_empty() {
                false
            } else if trigger.contains(' ') {
                lower.contains(&trigger)
            } else {
                words.iter().any(|word| word.starts_with(&trigger))
            }
        })
    }

    pub fn tier(&self, attempt_index: u32) -> &str {
        match attempt_index {
            0 | 1 => &self.focused,
            2 => &self.broadened,
            _ => &self.category,
        }
    }
}

fn topic(name: &str, triggers: &[&str], focused: &str, broadened: &str, category: &str) -> TopicRule {
    TopicRule {
        name: name.to_string(),
        triggers: triggers.iter().map(|t| t.to_string()).collect(),
        focused: focused.to_string(),
        broadened: broadened.to_string(),
        category: category.to_string(),
    }
}

pub fn default_topic_rules() -> Vec<TopicRule> {
    vec![
        topic(
            "salt",
            &["salt", "salinity", "reef salt", "hybrid"],
            "sea salt seawater reef salt salinity 35 ppt",
            "sea salt seawater mixing salinity trace elements probiotic",
            "marine aquarium seawater reef",
        ),
        topic(
            "dosage",
            &["dose", "dosing", "dosage", "how much", "ml", "apply"],
            "dosage dose ml per 100 l application",
            "dosage dosing schedule application instructions ml",
            "aquarium supplements usage instructions",
        ),
        topic(
            "coral",
            &["coral", "sps", "lps", "polyp"],
            "coral sps lps soft hard polyp",
            "coral growth coloration polyp extension sps lps",
            "marine aquarium coral reef",
        ),
        topic(
            "problem",
            &["problem", "cyano", "algae", "get rid", "high", "low"],
            "problem cyanobacteria algae nitrate phosphate",
            "problem solution cyanobacteria algae nutrients water clarity",
            "aquarium troubleshooting water quality",
        ),
        topic(
            "fish",
            &["fish", "anthias", "quarantine"],
            "fish acclimation quarantine disease",
            "fish acclimation disease quarantine treatment care",
            "marine fish care aquarium",
        ),
        topic(
            "water",
            &["water", "parameter", "ph", "alkalinity", "calcium", "magnesium"],
            "water parameters ph alkalinity calcium magnesium",
            "water chemistry ph kh calcium magnesium testing",
            "aquarium water parameters bacteria",
        ),
        topic(
            "startup",
            &["start", "setup", "set up", "first", "new tank", "cycle", "cycling"],
            "new aquarium setup nitrogen cycle start",
            "aquarium startup cycling bacteria maturation",
            "aquarium setup parameters bacteria",
        ),
    ]
}

pub fn default_domain_terms() -> String {
    "aquarium reef seawater freshwater products".to_string()
}

/// Words of three or more characters, lowercased, in query order.
pub fn content_words(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

pub struct ReformulationRequest<'a> {
    pub original_query: &'a str,
    pub intent: &'a str,
    pub attempt_index: u32,
    pub max_attempts: u32,
    pub previous: &'a [AttemptRecord],
}

/// Produces the search query for one attempt. Attempt 1 is focused, 2 is
/// broadened, 3 and later are category level.
#[async_trait]
pub trait QueryReformulator: Send + Sync {
    fn strategy_name(&self) -> &'static str;
    async fn reformulate(&self, request: &ReformulationRequest<'_>) -> String;
}

pub struct RuleReformulator {
    topics: Vec<TopicRule>,
    domain_terms: String,
}

impl RuleReformulator {
    pub fn new(topics: Vec<TopicRule>, domain_terms: String) -> Self {
        Self {
            topics,
            domain_terms,
        }
    }

    pub fn keywords_for(&self, query: &str, attempt_index: u32) -> String {
        if let Some(rule) = self.topics.iter().find(|rule| rule.matches(query)) {
            return rule.tier(attempt_index).trim().to_string();
        }

        let words = content_words(query).join(" ");
        match attempt_index {
            0 | 1 if !words.is_empty() => words,
            0..=2 if !words.is_empty() => format!("{words} {}", self.domain_terms),
            _ => self.domain_terms.clone(),
        }
    }
}

#[async_trait]
impl QueryReformulator for RuleReformulator {
    fn strategy_name(&self) -> &'static str {
        "rules"
    }

    async fn reformulate(&self, request: &ReformulationRequest<'_>) -> String {
        self.keywords_for(request.original_query, request.attempt_index)
    }
}

static KEYWORD_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(keywords|search|query)\s*:?\s*").ok());
static QUOTED: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r#""([^"]*)""#).ok());

/// Normalizes model output into a short keyword query.
pub fn clean_model_keywords(raw: &str, domain_terms: &str) -> String {
    let first_line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let mut cleaned = first_line.to_string();
    if let Some(prefix) = KEYWORD_PREFIX.as_ref() {
        cleaned = prefix.replace(&cleaned, "").into_owned();
    }
    if let Some(quoted) = QUOTED.as_ref() {
        cleaned = quoted.replace_all(&cleaned, "$1").into_owned();
    }
    cleaned = cleaned.replace(['"', '\'', '`'], " ");

    let mut words = cleaned.split_whitespace().collect::<Vec<&str>>();
    if words.is_empty() {
        return String::new();
    }
    words.truncate(MAX_REFORMULATED_WORDS);
    let joined = words.join(" ");
    if words.len() < MIN_REFORMULATED_WORDS {
        let padding = domain_terms
            .split_whitespace()
            .take(MIN_REFORMULATED_WORDS)
            .collect::<Vec<&str>>()
            .join(" ");
        return format!("{padding} {joined}").trim().to_string();
    }
    joined
}

/// Asks the language model for search keywords, falling back to the rule
/// table when the call fails.
pub struct ModelReformulator {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    domain_terms: String,
    domain_description: Option<String>,
    fallback: RuleReformulator,
}

impl ModelReformulator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        timeout: Duration,
        domain_terms: String,
        domain_description: Option<String>,
        fallback: RuleReformulator,
    ) -> Self {
        Self {
            model,
            timeout,
            domain_terms,
            domain_description,
            fallback,
        }
    }

    fn strategy(attempt_index: u32) -> &'static str {
        match attempt_index {
            0 | 1 => "FOCUSED: specific keywords for the exact question",
            2 => "EXPANDED: add synonyms, related terms and broader domain concepts",
            _ => "BROAD: high-level category terms for the domain",
        }
    }

    pub fn prompt(&self, request: &ReformulationRequest<'_>) -> String {
        let mut previous = String::new();
        if request.previous.is_empty() {
            previous.push_str("No previous attempts.\n");
        } else {
            for attempt in request.previous {
                previous.push_str(&format!(
                    "- attempt {}: '{}' scored {:.1}/10 ({})\n",
                    attempt.attempt_index,
                    attempt.query,
                    attempt.score,
                    truncate_chars(&attempt.rationale, 100)
                ));
            }
            previous.push_str("Those searches did not find good enough content. Try a different angle.\n");
        }

        format!(
            "Generate search keywords for a knowledge base.\n\
             {}Common domain terms: {}\n\n\
             User question: \"{}\"\n\
             Intent: {}\n\
             Attempt {}/{}. Strategy: {}\n\n\
             Previous attempts:\n{}\n\
             Use semantic domain terms and synonyms, not product codes. Do not repeat earlier \
             queries. Reply with 3 to 8 keywords on a single line and nothing else.",
            self.domain_description
                .as_deref()
                .map(|description| format!("Domain: {description}\n"))
                .unwrap_or_default(),
            self.domain_terms,
            request.original_query,
            request.intent,
            request.attempt_index,
            request.max_attempts,
            Self::strategy(request.attempt_index),
            previous
        )
    }
}

#[async_trait]
impl QueryReformulator for ModelReformulator {
    fn strategy_name(&self) -> &'static str {
        "model"
    }

    async fn reformulate(&self, request: &ReformulationRequest<'_>) -> String {
        let prompt = self.prompt(request);
        match complete_bounded(self.model.as_ref(), "reformulate", &prompt, self.timeout).await {
            Ok(raw) => {
                let cleaned = clean_model_keywords(&raw, &self.domain_terms);
                if !cleaned.is_empty() {
                    return cleaned;
                }
                tracing::warn!(
                    attempt = request.attempt_index,
                    "model reformulation produced no keywords; using rule table"
                );
            }
            Err(err) => {
                tracing::warn!(
                    attempt = request.attempt_index,
                    error = %err,
                    "model reformulation failed; using rule table"
                );
            }
        }
        self.fallback.reformulate(request).await
    }
}

fn normalized(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<String>>()
        .join(" ")
}

/// Guarantees the attempt query differs from every earlier attempt's query.
pub fn ensure_distinct(
    candidate: &str,
    original_query: &str,
    attempt_index: u32,
    previous: &[AttemptRecord],
) -> String {
    let taken = |query: &str| {
        let query = normalized(query);
        previous
            .iter()
            .any(|attempt| normalized(&attempt.query) == query)
    };

    let candidate = if candidate.trim().is_empty() {
        original_query.trim().to_string()
    } else {
        candidate.trim().to_string()
    };
    if !taken(&candidate) {
        return candidate;
    }

    let widened = format!("{candidate} {}", original_query.trim());
    if !taken(&widened) {
        return widened;
    }
    format!("{candidate} variant {attempt_index}")
}
