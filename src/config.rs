use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::*;
use crate::policy::{
    AUGMENTATION_ACCEPT_FLOOR, ConfidencePolicy, DEFAULT_ACCEPTANCE_FLOOR, DEFAULT_MAX_ATTEMPTS,
    USABLE_PARTIAL_FLOOR, default_intent_thresholds, default_protected_intents,
};
use crate::reformulate::{TopicRule, default_domain_terms, default_topic_rules};
use crate::safety::{
    DEFAULT_MAX_ANSWER_CHARS, DEFAULT_MIN_ANSWER_CHARS, SafetyValidator, default_contact_markers,
};

pub const DEFAULT_COMPANY_NAME: &str = "the company";

#[derive(Debug, Clone)]
pub struct ContactSettings {
    pub company_name: String,
    pub support_phone: Option<String>,
    pub support_url: Option<String>,
    pub support_hours: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub api_base_url: Option<String>,
    pub show_sensitive_config: bool,
    pub search_backend: SearchBackend,
    pub corpus_path: Option<String>,
    pub search_top_k: usize,
    pub search_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub reformulation: ReformulationStrategy,
    pub topics: Vec<TopicRule>,
    pub domain_terms: String,
    pub domain_description: Option<String>,
    pub intent_model_refinement: bool,
    pub acceptance_floor: f64,
    pub usable_partial_floor: f64,
    pub augmentation_accept_floor: f64,
    pub max_attempts: u32,
    pub intent_thresholds: BTreeMap<String, f64>,
    pub protected_intents: BTreeSet<String>,
    pub eval_max_documents: usize,
    pub eval_excerpt_chars: usize,
    pub augmentation_max_documents: usize,
    pub augmentation_excerpt_chars: usize,
    pub answer_min_chars: usize,
    pub answer_max_chars: usize,
    pub contact_markers: Vec<String>,
    pub contact: ContactSettings,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub max_query_chars: usize,
}

impl RuntimeConfig {
    pub fn confidence_policy(&self) -> ConfidencePolicy {
        ConfidencePolicy::new(
            self.acceptance_floor,
            self.usable_partial_floor,
            self.augmentation_accept_floor,
            self.max_attempts,
            self.intent_thresholds.clone(),
            self.protected_intents.clone(),
        )
    }

    pub fn safety_validator(&self) -> SafetyValidator {
        SafetyValidator::new(
            self.answer_min_chars,
            self.answer_max_chars,
            self.contact_markers.clone(),
            &self.contact,
        )
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub api_base_url: Option<String>,
    pub search_backend: Option<SearchBackend>,
    pub corpus_path: Option<String>,
    pub search_top_k: Option<usize>,
    pub search_timeout_secs: Option<u64>,
    pub model_timeout_secs: Option<u64>,
    pub reformulation: Option<ReformulationStrategy>,
    #[serde(default)]
    pub topics: Vec<TopicRule>,
    pub domain_terms: Option<String>,
    pub domain_description: Option<String>,
    pub intent_model_refinement: Option<bool>,
    pub acceptance_floor: Option<f64>,
    pub usable_partial_floor: Option<f64>,
    pub augmentation_accept_floor: Option<f64>,
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub intent_thresholds: BTreeMap<String, f64>,
    pub protected_intents: Option<Vec<String>>,
    pub eval_max_documents: Option<usize>,
    pub eval_excerpt_chars: Option<usize>,
    pub augmentation_max_documents: Option<usize>,
    pub augmentation_excerpt_chars: Option<usize>,
    pub answer_min_chars: Option<usize>,
    pub answer_max_chars: Option<usize>,
    #[serde(default)]
    pub contact_markers: Vec<String>,
    pub company_name: Option<String>,
    pub support_phone: Option<String>,
    pub support_url: Option<String>,
    pub support_hours: Option<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    pub max_query_chars: Option<usize>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider/backend values and field names.",
            path.display()
        )
    })
}

fn merge_unique_names(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();

    for name in first.iter().chain(second.iter()) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_ascii_lowercase()) {
            merged.push(trimmed.to_string());
        }
    }

    merged
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    // Profile thresholds extend the built-in table rather than replacing it.
    let mut intent_thresholds = default_intent_thresholds();
    for (intent, threshold) in &profile.intent_thresholds {
        intent_thresholds.insert(intent.trim().to_ascii_lowercase(), *threshold);
    }

    let protected_intents = match profile.protected_intents.as_ref() {
        Some(list) => list
            .iter()
            .map(|intent| intent.trim().to_ascii_lowercase())
            .filter(|intent| !intent.is_empty())
            .collect::<BTreeSet<String>>(),
        None => default_protected_intents(),
    };

    let contact_markers = {
        let merged = merge_unique_names(&default_contact_markers(), &profile.contact_markers);
        if merged.is_empty() {
            default_contact_markers()
        } else {
            merged
        }
    };

    let topics = if profile.topics.is_empty() {
        default_topic_rules()
    } else {
        profile.topics.clone()
    };

    let answer_min_chars = profile
        .answer_min_chars
        .unwrap_or(DEFAULT_MIN_ANSWER_CHARS);
    let answer_max_chars = profile
        .answer_max_chars
        .unwrap_or(DEFAULT_MAX_ANSWER_CHARS)
        .max(answer_min_chars);

    let corpus_path = non_empty(cli.corpus_path.clone().or(profile.corpus_path));
    let default_backend = if corpus_path.is_some() {
        SearchBackend::Local
    } else {
        SearchBackend::Disabled
    };

    let cfg = RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        provider,
        model: cli.model.clone().or(profile.model),
        api_base_url: non_empty(cli.api_base_url.clone().or(profile.api_base_url)),
        show_sensitive_config: cli.show_sensitive_config,
        search_backend: cli
            .search_backend
            .or(profile.search_backend)
            .unwrap_or(default_backend),
        corpus_path,
        search_top_k: cli
            .search_top_k
            .or(profile.search_top_k)
            .unwrap_or(8)
            .max(1),
        search_timeout_secs: cli
            .search_timeout_secs
            .or(profile.search_timeout_secs)
            .unwrap_or(10)
            .max(1),
        model_timeout_secs: cli
            .model_timeout_secs
            .or(profile.model_timeout_secs)
            .unwrap_or(45)
            .max(1),
        reformulation: cli
            .reformulation
            .or(profile.reformulation)
            .unwrap_or(ReformulationStrategy::Rules),
        topics,
        domain_terms: non_empty(profile.domain_terms).unwrap_or_else(default_domain_terms),
        domain_description: non_empty(profile.domain_description),
        intent_model_refinement: profile.intent_model_refinement.unwrap_or(false),
        acceptance_floor: profile.acceptance_floor.unwrap_or(DEFAULT_ACCEPTANCE_FLOOR),
        usable_partial_floor: profile.usable_partial_floor.unwrap_or(USABLE_PARTIAL_FLOOR),
        augmentation_accept_floor: profile
            .augmentation_accept_floor
            .unwrap_or(AUGMENTATION_ACCEPT_FLOOR),
        max_attempts: cli
            .max_attempts
            .or(profile.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1),
        intent_thresholds,
        protected_intents,
        eval_max_documents: profile.eval_max_documents.unwrap_or(4).max(1),
        eval_excerpt_chars: profile.eval_excerpt_chars.unwrap_or(400).max(64),
        augmentation_max_documents: profile.augmentation_max_documents.unwrap_or(3).max(1),
        augmentation_excerpt_chars: profile.augmentation_excerpt_chars.unwrap_or(800).max(64),
        answer_min_chars,
        answer_max_chars,
        contact_markers,
        contact: ContactSettings {
            company_name: non_empty(profile.company_name)
                .unwrap_or_else(|| DEFAULT_COMPANY_NAME.to_string()),
            support_phone: non_empty(cli.support_phone.clone().or(profile.support_phone)),
            support_url: non_empty(cli.support_url.clone().or(profile.support_url)),
            support_hours: non_empty(profile.support_hours),
        },
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".evalrag/telemetry/events.jsonl".to_string()),
        max_query_chars: profile.max_query_chars.unwrap_or(4_000).max(64),
    };

    let issues = cfg.confidence_policy().sanity_issues();
    if !issues.is_empty() {
        return Err(anyhow::anyhow!(
            "invalid confidence policy in profile '{}': {}",
            cfg.profile,
            issues.join("; ")
        ));
    }

    Ok(cfg)
}

pub fn display_api_base_url(cfg: &RuntimeConfig) -> String {
    cfg.api_base_url
        .clone()
        .unwrap_or_else(|| "<provider-default>".to_string())
}
