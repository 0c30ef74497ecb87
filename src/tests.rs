use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::json;
use tempfile::tempdir;

use crate::augmentation::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::eval::*;
use crate::evaluator::QualityEvaluator;
use crate::policy::*;
use crate::provider::LanguageModel;
use crate::reformulate::*;
use crate::request::*;
use crate::retrieval::*;
use crate::safety::default_contact_markers;
use crate::server::*;
use crate::telemetry::*;
use crate::tracker::PartialResultTracker;
use crate::workflow::*;

/// Replays queued completions in order and records every prompt. An empty
/// queue behaves like a broken transport.
struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, CollaboratorError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(CollaboratorError::Transport {
                operation: "model.complete",
                message: "script exhausted".to_string(),
            })
    }
}

struct StaticSearch {
    documents: Vec<Document>,
    calls: AtomicUsize,
}

impl StaticSearch {
    fn new(documents: Vec<Document>) -> Arc<Self> {
        Arc::new(Self {
            documents,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchService for StaticSearch {
    fn backend_name(&self) -> &'static str {
        "static"
    }

    async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<Document>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.documents.iter().take(top_k).cloned().collect())
    }
}

struct FailingSearch;

#[async_trait]
impl SearchService for FailingSearch {
    fn backend_name(&self) -> &'static str {
        "failing"
    }

    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<Document>, CollaboratorError> {
        Err(CollaboratorError::Transport {
            operation: "search",
            message: "connection refused".to_string(),
        })
    }
}

fn nitrate_docs() -> Vec<Document> {
    vec![
        Document {
            title: "Nitrate control".to_string(),
            full_content: "Lower nitrate with regular water changes and a protein skimmer."
                .to_string(),
            content_type: "article".to_string(),
            url: String::new(),
            relevance: 1.0,
        },
        Document {
            title: "NitraMinus".to_string(),
            full_content: "Bacterial supplement that reduces nitrate and phosphate.".to_string(),
            content_type: "product".to_string(),
            url: "https://shop.example/nitraminus".to_string(),
            relevance: 0.5,
        },
    ]
}

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".evalrag/config.toml".to_string(),
        provider: Provider::Auto,
        model: None,
        api_base_url: None,
        show_sensitive_config: false,
        search_backend: SearchBackend::Disabled,
        corpus_path: None,
        search_top_k: 8,
        search_timeout_secs: 5,
        model_timeout_secs: 5,
        reformulation: ReformulationStrategy::Rules,
        topics: default_topic_rules(),
        domain_terms: default_domain_terms(),
        domain_description: None,
        intent_model_refinement: false,
        acceptance_floor: DEFAULT_ACCEPTANCE_FLOOR,
        usable_partial_floor: USABLE_PARTIAL_FLOOR,
        augmentation_accept_floor: AUGMENTATION_ACCEPT_FLOOR,
        max_attempts: DEFAULT_MAX_ATTEMPTS,
        intent_thresholds: default_intent_thresholds(),
        protected_intents: default_protected_intents(),
        eval_max_documents: 4,
        eval_excerpt_chars: 400,
        augmentation_max_documents: 3,
        augmentation_excerpt_chars: 800,
        answer_min_chars: 100,
        answer_max_chars: 2000,
        contact_markers: default_contact_markers(),
        contact: ContactSettings {
            company_name: "Reef Co".to_string(),
            support_phone: Some("+1 555 0100".to_string()),
            support_url: Some("https://reef.example/contact".to_string()),
            support_hours: None,
        },
        telemetry_enabled: false,
        telemetry_path: ".evalrag/test-telemetry.jsonl".to_string(),
        max_query_chars: 4_000,
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        provider: Provider::Auto,
        model: None,
        api_base_url: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        search_backend: None,
        corpus_path: None,
        search_top_k: None,
        reformulation: None,
        model_timeout_secs: None,
        search_timeout_secs: None,
        max_attempts: None,
        support_phone: None,
        support_url: None,
        telemetry_enabled: None,
        telemetry_path: None,
        show_sensitive_config: false,
        log_filter: "warn".to_string(),
        command: Some(Commands::Doctor),
    }
}

fn workflow(
    cfg: &RuntimeConfig,
    model: Arc<ScriptedModel>,
    search: Arc<dyn SearchService>,
) -> AnswerWorkflow {
    AnswerWorkflow::build(cfg, model, search, TelemetrySink::disabled())
}

fn scores(answer: &FinalAnswer) -> Vec<f64> {
    answer.attempts.iter().map(|attempt| attempt.score).collect()
}

const CONTACT_TAIL: &str = " Call us on +1 555 0100.";

fn answer_of_len(total_chars: usize) -> String {
    format!(
        "{}{}",
        "a".repeat(total_chars - CONTACT_TAIL.chars().count()),
        CONTACT_TAIL
    )
}

#[tokio::test]
async fn no_usable_partial_escalates_with_best_score() {
    let model = ScriptedModel::new(&["CONFIDENCE: 3", "CONFIDENCE: 4", "CONFIDENCE: 3.5"]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search.clone());

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(scores(&answer), vec![3.0, 4.0, 3.5]);
    assert_eq!(answer.confidence, 4.0);
    assert!(answer.escalation_reason.is_some());
    assert!(answer.answer_text.contains("+1 555 0100"));
    assert_eq!(model.calls(), 3, "no generation should follow");
}

#[tokio::test]
async fn usable_partial_is_augmented_and_accepted() {
    let generated = answer_of_len(250);
    assert_eq!(generated.chars().count(), 250);
    let model = ScriptedModel::new(&[
        "CONFIDENCE: 4",
        "CONFIDENCE: 5.5",
        "CONFIDENCE: 4.5",
        &generated,
        "CONFIDENCE: 8\nREASONING: faithful and safe",
    ]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Augmented);
    assert_eq!(answer.confidence, 8.0);
    assert_eq!(answer.answer_text, generated);
    assert_eq!(answer.attempts.len(), 3);
    assert!(answer.escalation_reason.is_none());

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 5);
    assert!(prompts[3].contains("Lower nitrate with regular water changes"));
    assert!(prompts[4].contains(&generated));
}

#[tokio::test]
async fn first_attempt_above_threshold_accepts_immediately() {
    let model = ScriptedModel::new(&["CONFIDENCE: 9", "Do weekly 10% water changes."]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search.clone());

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Direct);
    assert_eq!(answer.confidence, 9.0);
    assert_eq!(answer.attempts.len(), 1);
    assert_eq!(search.calls(), 1);
    assert!(answer.answer_text.starts_with("Do weekly 10% water changes."));
    assert!(
        answer
            .answer_text
            .contains("- NitraMinus: https://shop.example/nitraminus")
    );
}

#[tokio::test]
async fn dosage_intent_uses_packaging_fallback_over_augmentation() {
    let model = ScriptedModel::new(&["CONFIDENCE: 5", "CONFIDENCE: 5", "CONFIDENCE: 5"]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("How much NitraMinus for 300 l?", Some("dosage"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(answer.confidence, 7.0);
    assert_eq!(answer.attempts.len(), 3);
    assert_eq!(
        answer.escalation_reason.as_deref(),
        Some("dosage fallback: packaging instructions")
    );
    assert!(answer.answer_text.contains("packaging"));
    assert_eq!(model.calls(), 3);

    let encoded = serde_json::to_value(answer.view()).expect("view should serialize");
    assert_eq!(encoded["provenance"], "escalated");
}

#[tokio::test]
async fn short_augmented_answer_fails_safety_and_escalates() {
    let short = answer_of_len(60);
    let model = ScriptedModel::new(&[
        "CONFIDENCE: 6",
        "CONFIDENCE: 6.5",
        "CONFIDENCE: 6",
        &short,
        "CONFIDENCE: 9",
    ]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(answer.confidence, 6.5);
    assert!(
        answer
            .escalation_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("too_short"))
    );
    assert_eq!(model.calls(), 4, "second evaluation is skipped");
}

#[tokio::test]
async fn augmentation_generation_failure_escalates() {
    let model = ScriptedModel::new(&["CONFIDENCE: 4", "CONFIDENCE: 5.5", "CONFIDENCE: 4.5"]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("generation failure still yields an answer");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(answer.confidence, 5.5);
    assert!(
        answer
            .escalation_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("generation failed"))
    );
    assert_eq!(model.calls(), 4, "generation is not retried");
}

#[tokio::test]
async fn low_second_score_escalates_with_reason() {
    let generated = answer_of_len(250);
    let model = ScriptedModel::new(&[
        "CONFIDENCE: 4",
        "CONFIDENCE: 5.5",
        "CONFIDENCE: 4.5",
        &generated,
        "CONFIDENCE: 6.9",
    ]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(answer.confidence, 5.5);
    assert_eq!(
        answer.escalation_reason.as_deref(),
        Some("second evaluation scored 6.9 below 7.0")
    );
    assert_ne!(answer.answer_text, generated);
    assert_eq!(model.calls(), 5);
}

#[tokio::test]
async fn protected_intent_is_never_augmented() {
    let model = ScriptedModel::new(&["CONFIDENCE: 6", "CONFIDENCE: 6", "CONFIDENCE: 6"]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search);

    let answer = workflow
        .answer("Terms for selling your salt", Some("business"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(model.calls(), 3);
    assert!(
        answer
            .escalation_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("protected"))
    );
}

#[tokio::test]
async fn attempts_never_exceed_max_and_queries_stay_distinct() {
    let mut cfg = base_cfg();
    cfg.max_attempts = 5;
    let model = ScriptedModel::new(&["CONFIDENCE: 2"; 5]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&cfg, model, search.clone());

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(answer.attempts.len(), 5);
    assert_eq!(search.calls(), 5);
    let queries = answer
        .attempts
        .iter()
        .map(|attempt| attempt.query.to_lowercase())
        .collect::<HashSet<String>>();
    assert_eq!(queries.len(), 5);
    assert_eq!(
        answer
            .attempts
            .iter()
            .map(|attempt| attempt.attempt_index)
            .collect::<Vec<u32>>(),
        vec![1, 2, 3, 4, 5]
    );
}

#[tokio::test]
async fn search_failures_record_zero_scores_and_escalate() {
    let model = ScriptedModel::new(&[]);
    let workflow = workflow(&base_cfg(), model.clone(), Arc::new(FailingSearch));

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("search failures never surface as errors");

    assert_eq!(answer.provenance, Provenance::Escalated);
    assert_eq!(scores(&answer), vec![0.0, 0.0, 0.0]);
    assert!(
        answer
            .attempts
            .iter()
            .all(|attempt| attempt.status == AttemptStatus::SearchFailed)
    );
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn malformed_scores_fall_back_to_low_confidence() {
    let model = ScriptedModel::new(&[
        "Looks great to me",
        "CONFIDENCE: 12",
        "CONFIDENCE: 9\nCONFIDENCE: 4",
    ]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model, search);

    let answer = workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    assert_eq!(scores(&answer), vec![3.0, 3.0, 3.0]);
    assert!(
        answer
            .attempts
            .iter()
            .all(|attempt| attempt.status == AttemptStatus::EvaluationFallback)
    );
    assert_eq!(answer.provenance, Provenance::Escalated);
}

#[tokio::test]
async fn classified_business_and_trade_secret_skip_retrieval() {
    let model = ScriptedModel::new(&[]);
    let search = StaticSearch::new(nitrate_docs());
    let workflow = workflow(&base_cfg(), model.clone(), search.clone());

    let partnership = workflow
        .answer("We want to become a distributor in Poland", None)
        .await
        .expect("answer should resolve");
    assert_eq!(partnership.provenance, Provenance::Business);
    assert_eq!(partnership.confidence, 10.0);
    assert!(partnership.attempts.is_empty());

    let secret = workflow
        .answer("What is the exact composition of your salt?", None)
        .await
        .expect("answer should resolve");
    assert_eq!(secret.provenance, Provenance::TradeSecret);
    assert_eq!(secret.intent, "production");

    assert_eq!(search.calls(), 0);
    assert_eq!(model.calls(), 0);
    assert_ne!(partnership.request_id, secret.request_id);
}

#[tokio::test]
async fn empty_and_oversized_queries_are_rejected() {
    let mut cfg = base_cfg();
    cfg.max_query_chars = 64;
    let workflow = workflow(&cfg, ScriptedModel::new(&[]), StaticSearch::new(Vec::new()));

    let err = workflow.answer("   ", None).await.unwrap_err();
    assert!(err.to_string().contains("cannot be empty"));

    let err = workflow.answer(&"x".repeat(65), None).await.unwrap_err();
    assert!(err.to_string().contains("limit is 64"));
}

#[tokio::test]
async fn augmentation_controller_rejects_protected_context() {
    let cfg = base_cfg();
    let policy = Arc::new(cfg.confidence_policy());
    let model = ScriptedModel::new(&["should never be used"]);
    let evaluator = Arc::new(QualityEvaluator::new(
        model.clone(),
        cfg.model_timeout(),
        4,
        400,
        None,
    ));
    let controller = AugmentationController::new(
        model.clone(),
        evaluator,
        cfg.safety_validator(),
        policy.clone(),
        cfg.contact.clone(),
        cfg.model_timeout(),
        3,
        800,
    );
    let ctx = RequestContext::new("req-x".to_string(), "dose?", "dosage", &policy);
    let mut tracker = PartialResultTracker::new(policy.usable_partial_floor());
    tracker.observe(&AttemptRecord {
        attempt_index: 1,
        query: "dose".to_string(),
        documents: nitrate_docs(),
        score: 5.5,
        rationale: String::new(),
        status: AttemptStatus::Evaluated,
        timestamp: chrono::Utc::now(),
    });

    let err = controller.run(&ctx, &tracker).await.unwrap_err();
    assert!(matches!(err, AugmentationFailure::InvariantViolation { .. }));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn workflow_emits_request_telemetry() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("events.jsonl");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = path.to_string_lossy().to_string();
    let telemetry = TelemetrySink::new(&cfg, "ask".to_string());
    let model = ScriptedModel::new(&["CONFIDENCE: 3", "CONFIDENCE: 3", "CONFIDENCE: 3"]);
    let workflow = AnswerWorkflow::build(
        &cfg,
        model,
        StaticSearch::new(nitrate_docs()),
        telemetry,
    );

    workflow
        .answer("How do I lower nitrate?", Some("general"))
        .await
        .expect("answer should resolve");

    let lines = std::fs::read_to_string(&path)
        .expect("telemetry file should exist")
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.parse_errors, 0);
    assert_eq!(summary.requests_completed, 1);
    assert_eq!(summary.total_attempts, 3);
    assert_eq!(summary.provenance_counts.get("escalated"), Some(&1));
    assert_eq!(summary.command_counts.get("ask"), Some(&4));
}

#[test]
fn telemetry_summary_tracks_outcomes() {
    let lines = vec![
        json!({"ts_unix_ms": 1000, "event": "command.completed", "run_id": "r1", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 1100, "event": "request.completed", "run_id": "r1", "command": "ask", "provenance": "augmented", "attempts": 3})
            .to_string(),
        json!({"ts_unix_ms": 1200, "event": "request.completed", "run_id": "r2", "command": "server.serve", "provenance": "escalated", "attempts": 2})
            .to_string(),
        json!({"ts_unix_ms": 1300, "event": "augmentation.accepted", "run_id": "r1", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 1400, "event": "invariant.violated", "run_id": "r2", "command": "server.serve"})
            .to_string(),
        "not json".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 6);
    assert_eq!(summary.parsed_events, 5);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.requests_completed, 2);
    assert_eq!(summary.augmentation_accepted, 1);
    assert_eq!(summary.invariant_violations, 1);
    assert_eq!(summary.escalation_rate(), 0.5);
    assert_eq!(summary.average_attempts(), 2.5);
    assert_eq!(summary.last_event_ts_unix_ms, Some(1400));
}

#[test]
fn runtime_config_defaults_without_profile_file() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("missing.toml");
    let cli = test_cli(&config_path.to_string_lossy(), "default");

    let profiles = load_profiles(&cli.config_path).expect("missing file is an empty profile set");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.search_backend, SearchBackend::Disabled);
    assert_eq!(cfg.search_top_k, 8);
    assert_eq!(cfg.max_attempts, 3);
    assert_eq!(cfg.reformulation, ReformulationStrategy::Rules);
    assert_eq!(cfg.contact.company_name, DEFAULT_COMPANY_NAME);
    assert_eq!(
        crate::responders::contact_reference(&cfg.contact),
        "reach the company's support team"
    );
    assert_eq!(cfg.telemetry_path, ".evalrag/telemetry/events.jsonl");
    assert!(cfg.telemetry_enabled);
    let policy = cfg.confidence_policy();
    assert_eq!(policy.threshold_for("dosage"), 6.0);
    assert_eq!(policy.threshold_for("unheard-of"), 7.0);
    assert!(policy.is_protected("business"));
}

#[test]
fn runtime_config_merges_profile_policy_and_cli_overrides() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[profiles.reef]
provider = "ollama"
model = "llama3.1"
corpus_path = "kb/reef.json"
search_top_k = 5
max_attempts = 4
company_name = "Reef Co"
support_phone = "+48 600 000 000"
support_hours = "Mon-Fri 8-16"
contact_markers = ["hotline", "WhatsApp"]
domain_terms = "reef aquarium"
protected_intents = ["Dosage", "business", "medical"]

[profiles.reef.intent_thresholds]
Dosage = 6.5
medical = 9.5

[[profiles.reef.topics]]
name = "lighting"
triggers = ["light", "led"]
focused = "led lighting par"
broadened = "lighting spectrum par coral"
category = "aquarium lighting"
"#,
    )
    .expect("config should write");

    let mut cli = test_cli(&config_path.to_string_lossy(), "reef");
    cli.max_attempts = Some(2);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.provider, Provider::Ollama);
    assert_eq!(cfg.model.as_deref(), Some("llama3.1"));
    assert_eq!(cfg.search_backend, SearchBackend::Local);
    assert_eq!(cfg.corpus_path.as_deref(), Some("kb/reef.json"));
    assert_eq!(cfg.search_top_k, 5);
    assert_eq!(cfg.max_attempts, 2, "cli wins over profile");
    assert_eq!(cfg.domain_terms, "reef aquarium");
    assert_eq!(cfg.topics.len(), 1);
    assert_eq!(cfg.topics[0].name, "lighting");
    assert_eq!(cfg.contact.support_hours.as_deref(), Some("Mon-Fri 8-16"));
    assert!(cfg.contact_markers.iter().any(|m| m == "WhatsApp"));
    assert_eq!(
        cfg.contact_markers
            .iter()
            .filter(|m| m.eq_ignore_ascii_case("hotline"))
            .count(),
        1
    );

    let policy = cfg.confidence_policy();
    assert_eq!(policy.threshold_for("dosage"), 6.5);
    assert_eq!(policy.threshold_for("medical"), 9.5);
    assert_eq!(policy.threshold_for("general"), 7.0);
    assert!(policy.is_protected("medical"));
    assert!(!policy.is_protected("production"));
}

#[test]
fn runtime_config_rejects_unknown_profile_and_bad_policy() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        r#"
[profiles.strict]
acceptance_floor = 12.0

[profiles.unprotected]
protected_intents = ["business"]
"#,
    )
    .expect("config should write");
    let profiles = load_profiles(&config_path.to_string_lossy()).expect("profiles should load");

    let err = resolve_runtime_config(&test_cli(&config_path.to_string_lossy(), "ops"), &profiles)
        .unwrap_err();
    assert!(err.to_string().contains("Available profiles: strict, unprotected"));

    let err =
        resolve_runtime_config(&test_cli(&config_path.to_string_lossy(), "strict"), &profiles)
            .unwrap_err();
    assert!(err.to_string().contains("invalid confidence policy"));
    assert_eq!(categorize_error(&err), ErrorCategory::Policy);

    let err = resolve_runtime_config(
        &test_cli(&config_path.to_string_lossy(), "unprotected"),
        &profiles,
    )
    .unwrap_err();
    assert!(err.to_string().contains("dosage fallback"));
}

#[test]
fn profile_file_rejects_unknown_fields() {
    let dir = tempdir().expect("temp directory should create");
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[profiles.dev]\nretrieval_backend = \"local\"\n")
        .expect("config should write");

    let err = load_profiles(&config_path.to_string_lossy()).unwrap_err();
    assert!(err.to_string().contains("invalid profile configuration"));
}

fn server_state(model: Arc<ScriptedModel>, auth_token: Option<&str>) -> Arc<ServerState> {
    let cfg = base_cfg();
    let workflow = Arc::new(workflow(&cfg, model, StaticSearch::new(nitrate_docs())));
    Arc::new(ServerState {
        cfg,
        workflow,
        telemetry: TelemetrySink::disabled(),
        search_backend: "static".to_string(),
        provider_label: "scripted".to_string(),
        model_name: "scripted".to_string(),
        auth_token: auth_token.map(str::to_string),
    })
}

#[tokio::test]
async fn server_health_reports_profile_and_backend() {
    let state = server_state(ScriptedModel::new(&[]), None);
    let Json(health) = handle_server_health(State(state)).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.profile, "default");
    assert_eq!(health.search_backend, "static");
}

#[tokio::test]
async fn server_ask_returns_answer_view_with_trail() {
    let state = server_state(
        ScriptedModel::new(&["CONFIDENCE: 8", "Change 10% of the water weekly."]),
        None,
    );
    let request = ServerAskRequest {
        query: "How do I lower nitrate?".to_string(),
        intent: Some("general".to_string()),
    };

    let Json(response) = handle_server_ask(State(state), HeaderMap::new(), Json(request))
        .await
        .expect("ask should succeed");

    assert_eq!(response.answer.provenance, Provenance::Direct);
    assert_eq!(response.answer.confidence, 8.0);
    assert_eq!(response.answer.attempts.len(), 1);
    assert_eq!(response.answer.attempts[0].attempt_index, 1);
    assert!(response.latency_ms >= 0.0);

    let encoded = serde_json::to_value(&response).expect("response should serialize");
    assert_eq!(encoded["provenance"], "direct");
    assert!(encoded.get("escalation_reason").is_none());
}

#[tokio::test]
async fn server_ask_rejects_blank_query() {
    let state = server_state(ScriptedModel::new(&[]), None);
    let request = ServerAskRequest {
        query: "  ".to_string(),
        intent: None,
    };
    let (status, _) = handle_server_ask(State(state), HeaderMap::new(), Json(request))
        .await
        .unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn server_auth_requires_matching_bearer_token() {
    let state = server_state(ScriptedModel::new(&[]), Some("s3cret"));

    let (status, _) = check_server_auth(&state, &HeaderMap::new()).unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut wrong = HeaderMap::new();
    wrong.insert("authorization", HeaderValue::from_static("Bearer nope"));
    assert!(check_server_auth(&state, &wrong).is_err());

    let mut right = HeaderMap::new();
    right.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
    assert!(check_server_auth(&state, &right).is_ok());
}

#[tokio::test]
async fn eval_harness_checks_intent_and_first_attempt_coverage() {
    let dataset = serde_json::from_value::<EvalDataset>(json!({
        "name": "inline",
        "version": "1",
        "cases": [
            {
                "id": "dose",
                "query": "How much buffer should I dose?",
                "expected_intent": "dosage",
                "chunks": ["Dose 10 ml per 100 l daily.", "Coral polyp extension tips."],
                "required_terms": ["ml per 100 l"]
            },
            {
                "id": "wrong-intent",
                "query": "How do I get rid of algae?",
                "expected_intent": "dosage",
                "chunks": ["Algae feed on nitrate and phosphate."],
                "required_terms": ["phosphate"]
            }
        ]
    }))
    .expect("dataset should parse");
    let rules = RuleReformulator::new(default_topic_rules(), default_domain_terms());

    let report = run_eval_harness(&dataset, &rules, 0.5)
        .await
        .expect("harness should run");

    assert_eq!(report.total_cases, 2);
    assert_eq!(report.passed_cases, 1);
    assert_eq!(report.intent_accuracy, 0.5);
    assert!(report.passed_threshold);
    let failed = &report.case_reports[1];
    assert_eq!(failed.detected_intent, "troubleshooting");
    assert_eq!(failed.matched_terms, 1);
    assert!(!failed.passed);
}

#[tokio::test]
async fn bundled_eval_dataset_passes() {
    let dataset = load_eval_dataset(DEFAULT_EVAL_DATASET_PATH).expect("dataset should load");
    let rules = RuleReformulator::new(default_topic_rules(), default_domain_terms());
    let report = run_eval_harness(&dataset, &rules, 1.0)
        .await
        .expect("harness should run");
    let failures = report
        .case_reports
        .iter()
        .filter(|case| !case.passed)
        .map(|case| case.id.clone())
        .collect::<Vec<String>>();
    assert!(failures.is_empty(), "failing cases: {failures:?}");
}

#[test]
fn eval_report_writes_json_to_nested_path() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("nested/report.json");
    let report = EvalRunReport {
        generated_at_unix_ms: 1,
        dataset_name: "d".to_string(),
        dataset_version: "1".to_string(),
        dataset_description: String::new(),
        total_cases: 0,
        passed_cases: 0,
        failed_cases: 0,
        intent_accuracy: 1.0,
        pass_rate: 0.0,
        fail_under: 0.0,
        passed_threshold: true,
        avg_latency_ms: 0.0,
        p95_latency_ms: 0.0,
        case_reports: Vec::new(),
    };
    write_eval_report(&path.to_string_lossy(), &report).expect("report should write");
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("report should read"))
            .expect("report should be json");
    assert_eq!(written["dataset_name"], "d");
}

#[test]
fn eval_metrics_round_and_pick_percentiles() {
    assert_eq!(round_metric(1.23456), 1.235);
    assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 95.0), 4.0);
    assert_eq!(percentile(&[], 50.0), 0.0);
    assert_eq!(
        normalize_eval_terms(&[" Nitrate ".to_string(), "nitrate".to_string()], "q"),
        vec!["nitrate".to_string()]
    );
}

#[test]
fn local_corpus_loads_from_disk_for_search() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("kb.txt");
    std::fs::write(
        &path,
        "Calcium basics\nKeep calcium near 420 mg/l.\n\nAlkalinity\nKeep alkalinity stable.\n",
    )
    .expect("corpus should write");

    let mut cfg = base_cfg();
    cfg.search_backend = SearchBackend::Local;
    cfg.corpus_path = Some(path.to_string_lossy().to_string());
    let service = build_search_service(&cfg).expect("local search should build");
    assert_eq!(service.backend_name(), "local");

    cfg.corpus_path = None;
    let err = build_search_service(&cfg).err().expect("missing corpus path should fail");
    assert!(err.to_string().contains("--corpus-path"));
}

#[test]
fn cli_error_formatting_includes_category_hint() {
    let err = anyhow::anyhow!("OPENAI_API_KEY is required for OpenAI provider");
    let rendered = format_cli_error(&err, false);
    assert!(rendered.starts_with("[PROVIDER]"));
    assert!(rendered.contains("Hint:"));
}
