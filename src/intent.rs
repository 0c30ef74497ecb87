use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::provider::{LanguageModel, complete_bounded};

pub const GENERAL_INTENT: &str = "general";

const BUSINESS_PATTERNS: &[&str] = &[
    "partnership",
    "distribution",
    "distributor",
    "dealer",
    "wholesale",
    "reseller",
    "cooperation",
    "collaborate",
    "become a partner",
    "represent your brand",
    "sell your products",
    "business inquiry",
];

const PRODUCTION_PATTERNS: &[&str] = &[
    "how is it made",
    "how is it produced",
    "how are they made",
    "how do you make",
    "how do you produce",
    "production process",
    "production method",
    "manufacturing process",
    "manufacturing technology",
    "recipe",
    "exact composition",
    "exact ingredients",
    "formula",
];

const DOSAGE_PATTERNS: &[&str] = &[
    "dosage",
    "dose",
    "dosing",
    "how much",
    "how many ml",
    "how to use",
    "how often",
    "frequency",
    "ratio",
    "proportion",
    "amount",
    "portion",
];

const PROBLEM_PATTERNS: &[&str] = &[
    "problem",
    "get rid of",
    "remove",
    "how to lower",
    "what to do",
    "advice",
    "solution",
    "fight",
    "prevent",
    "treat",
    "cure",
];

const SUPPORT_PATTERNS: &[&str] = &[
    "not working",
    "doesn't work",
    "does not work",
    "broken",
    "malfunction",
    "error",
    "technical support",
    "need help",
    "where do i start",
    "instructions",
];

const REFINED_INTENTS: &[(&str, &str)] = &[
    ("technical", "technical"),
    ("product", "product_info"),
    ("product_info", "product_info"),
    ("troubleshooting", "troubleshooting"),
    ("setup", "setup"),
    ("maintenance", "maintenance"),
    ("general", "general"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessKind {
    Partnership,
    TechnicalSupport,
}

impl BusinessKind {
    pub fn label(self) -> &'static str {
        match self {
            BusinessKind::Partnership => "partnership",
            BusinessKind::TechnicalSupport => "technical_support",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Pattern,
    Model,
    Explicit,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentAnalysis {
    pub intent: String,
    pub business: Option<BusinessKind>,
    pub trade_secret: bool,
    pub source: IntentSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Business(BusinessKind),
    TradeSecret,
    Retrieval,
}

impl IntentAnalysis {
    /// Caller-supplied label; skips classification and routing.
    pub fn explicit(intent: &str) -> Self {
        let intent = crate::policy::normalize_intent(intent);
        Self {
            intent: if intent.is_empty() {
                GENERAL_INTENT.to_string()
            } else {
                intent
            },
            business: None,
            trade_secret: false,
            source: IntentSource::Explicit,
        }
    }

    pub fn route(&self) -> Route {
        if let Some(kind) = self.business {
            return Route::Business(kind);
        }
        if self.trade_secret {
            return Route::TradeSecret;
        }
        Route::Retrieval
    }
}

/// Phrase match anchored at a word start.
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(start, _)| {
        haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|previous| !previous.is_alphanumeric())
    })
}

fn matches_any(query: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| contains_phrase(query, pattern))
}

/// Pattern pass. Categories are checked in a fixed order and a later match
/// overrides the intent; business routing, once set, sticks.
pub fn classify_patterns(query: &str) -> IntentAnalysis {
    let lower = query.to_lowercase();
    let mut analysis = IntentAnalysis {
        intent: GENERAL_INTENT.to_string(),
        business: None,
        trade_secret: false,
        source: IntentSource::Default,
    };
    let hit = |analysis: &mut IntentAnalysis, intent: &str| {
        analysis.intent = intent.to_string();
        analysis.source = IntentSource::Pattern;
    };

    if matches_any(&lower, BUSINESS_PATTERNS) {
        hit(&mut analysis, "business");
        analysis.business = Some(BusinessKind::Partnership);
    }
    if matches_any(&lower, PRODUCTION_PATTERNS) {
        hit(&mut analysis, "production");
        analysis.trade_secret = true;
    }
    if matches_any(&lower, DOSAGE_PATTERNS) {
        hit(&mut analysis, "dosage");
    }
    if matches_any(&lower, PROBLEM_PATTERNS) {
        hit(&mut analysis, "troubleshooting");
    }
    if matches_any(&lower, SUPPORT_PATTERNS) {
        hit(&mut analysis, "support");
        analysis.business = Some(BusinessKind::TechnicalSupport);
    }
    analysis
}

pub fn map_refined_intent(raw: &str) -> Option<&'static str> {
    let cleaned = raw
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
        .to_lowercase();
    REFINED_INTENTS
        .iter()
        .find(|(label, _)| *label == cleaned)
        .map(|(_, intent)| *intent)
}

pub struct IntentClassifier {
    refinement: Option<(Arc<dyn LanguageModel>, Duration)>,
}

impl IntentClassifier {
    pub fn patterns_only() -> Self {
        Self { refinement: None }
    }

    pub fn with_model_refinement(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            refinement: Some((model, timeout)),
        }
    }

    pub async fn classify(&self, query: &str) -> IntentAnalysis {
        let analysis = classify_patterns(query);
        if analysis.intent != GENERAL_INTENT {
            return analysis;
        }
        let Some((model, timeout)) = self.refinement.as_ref() else {
            return analysis;
        };

        let prompt = format!(
            "Classify the intent of this customer question.\n\
             Question: \"{query}\"\n\
             Options:\n\
             - technical: water parameters, chemistry, processes\n\
             - product: product information, comparisons, recommendations\n\
             - troubleshooting: a problem that needs a solution\n\
             - setup: new tank or equipment configuration\n\
             - maintenance: routine care\n\
             - general: anything else or unclear\n\
             Reply with the option name only."
        );
        match complete_bounded(model.as_ref(), "intent.refine", &prompt, *timeout).await {
            Ok(raw) => {
                let intent = map_refined_intent(&raw).unwrap_or(GENERAL_INTENT);
                tracing::debug!(raw = %raw, intent, "model intent refinement");
                IntentAnalysis {
                    intent: intent.to_string(),
                    business: None,
                    trade_secret: false,
                    source: IntentSource::Model,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "intent refinement failed; keeping general");
                analysis
            }
        }
    }
}
