use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::intent::classify_patterns;
use crate::request::Document;
use crate::reformulate::RuleReformulator;
use crate::retrieval::{LocalCorpusSearch, SearchService, query_terms};
use crate::telemetry::{TelemetrySink, unix_ms_now};

pub const DEFAULT_EVAL_DATASET_PATH: &str = "evals/datasets/intent-baseline.v1.json";
pub const DEFAULT_EVAL_OUTPUT_PATH: &str = ".evalrag/evals/latest.json";

#[derive(Debug, Deserialize)]
pub struct EvalDataset {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub cases: Vec<EvalCase>,
}

#[derive(Debug, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub query: String,
    pub expected_intent: Option<String>,
    pub chunks: Vec<String>,
    #[serde(default)]
    pub required_terms: Vec<String>,
    #[serde(default = "default_eval_max_chunks")]
    pub max_chunks: usize,
    pub min_term_matches: Option<usize>,
}

fn default_eval_max_chunks() -> usize {
    3
}

#[derive(Debug, Serialize)]
pub struct EvalCaseReport {
    pub id: String,
    pub passed: bool,
    pub detected_intent: String,
    pub expected_intent: Option<String>,
    pub intent_matched: bool,
    pub first_query: String,
    pub required_terms: usize,
    pub matched_terms: usize,
    pub retrieved_chunks: usize,
    pub latency_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct EvalRunReport {
    pub generated_at_unix_ms: u128,
    pub dataset_name: String,
    pub dataset_version: String,
    pub dataset_description: String,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub intent_accuracy: f64,
    pub pass_rate: f64,
    pub fail_under: f64,
    pub passed_threshold: bool,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub case_reports: Vec<EvalCaseReport>,
}

pub fn load_eval_dataset(path: &str) -> Result<EvalDataset> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read eval dataset at '{}'", path))?;
    let dataset = serde_json::from_str::<EvalDataset>(&content)
        .with_context(|| format!("invalid eval dataset json at '{}'", path))?;
    if dataset.cases.is_empty() {
        return Err(anyhow::anyhow!(
            "eval dataset '{}' has no cases; add at least one case",
            path
        ));
    }
    Ok(dataset)
}

pub fn normalize_eval_terms(raw_terms: &[String], query: &str) -> Vec<String> {
    let mut terms = if raw_terms.is_empty() {
        query_terms(query)
    } else {
        raw_terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect::<Vec<String>>()
    };

    terms.sort();
    terms.dedup();
    terms
}

pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let pct = pct.clamp(0.0, 100.0);
    let rank = ((pct / 100.0) * ((values.len() - 1) as f64)).round() as usize;
    values[rank.min(values.len() - 1)]
}

pub fn round_metric(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn case_corpus(case: &EvalCase) -> Vec<Document> {
    case.chunks
        .iter()
        .enumerate()
        .map(|(idx, chunk)| Document {
            title: format!("eval:{}#{}", case.id, idx + 1),
            full_content: chunk.clone(),
            content_type: "article".to_string(),
            url: String::new(),
            relevance: 0.0,
        })
        .collect()
}

/// Offline check of the deterministic stages: pattern intent classification
/// and what the first reformulated query retrieves from each case's chunks.
/// No language model is involved.
pub async fn run_eval_harness(
    dataset: &EvalDataset,
    reformulator: &RuleReformulator,
    fail_under: f64,
) -> Result<EvalRunReport> {
    let mut passed_cases = 0usize;
    let mut intent_hits = 0usize;
    let mut intent_cases = 0usize;
    let mut latency_ms = Vec::<f64>::new();
    let mut case_reports = Vec::<EvalCaseReport>::new();

    for case in &dataset.cases {
        if case.id.trim().is_empty() {
            return Err(anyhow::anyhow!("eval dataset contains case with empty id"));
        }
        if case.query.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "eval case '{}' has empty query; each case must include query",
                case.id
            ));
        }
        if case.chunks.is_empty() {
            return Err(anyhow::anyhow!(
                "eval case '{}' has no chunks; each case must include corpus chunks",
                case.id
            ));
        }

        let case_start = Instant::now();
        let analysis = classify_patterns(&case.query);
        let intent_matched = match case.expected_intent.as_deref() {
            Some(expected) => {
                intent_cases += 1;
                let matched = expected.trim().eq_ignore_ascii_case(&analysis.intent);
                if matched {
                    intent_hits += 1;
                }
                matched
            }
            None => true,
        };

        let search = LocalCorpusSearch {
            documents: case_corpus(case),
        };
        let first_query = reformulator.keywords_for(&case.query, 1);
        let retrieved = search
            .search(&first_query, case.max_chunks.max(1))
            .await
            .with_context(|| format!("search failed for eval case '{}'", case.id))?;
        let case_latency_ms = case_start.elapsed().as_secs_f64() * 1000.0;
        latency_ms.push(case_latency_ms);

        let terms = normalize_eval_terms(&case.required_terms, &case.query);
        if terms.is_empty() {
            return Err(anyhow::anyhow!(
                "eval case '{}' produced no required terms; add required_terms or a richer query",
                case.id
            ));
        }

        let joined = retrieved
            .iter()
            .map(|doc| doc.full_content.to_lowercase())
            .collect::<Vec<String>>()
            .join("\n");

        let matched_terms = terms
            .iter()
            .filter(|term| joined.contains(term.as_str()))
            .count();
        let required_terms = terms.len();
        let min_term_matches = case
            .min_term_matches
            .unwrap_or(required_terms)
            .clamp(1, required_terms);
        let passed = intent_matched && matched_terms >= min_term_matches;
        if passed {
            passed_cases += 1;
        }

        case_reports.push(EvalCaseReport {
            id: case.id.clone(),
            passed,
            detected_intent: analysis.intent,
            expected_intent: case.expected_intent.clone(),
            intent_matched,
            first_query,
            required_terms,
            matched_terms,
            retrieved_chunks: retrieved.len(),
            latency_ms: round_metric(case_latency_ms),
        });
    }

    let total_cases = dataset.cases.len();
    let failed_cases = total_cases.saturating_sub(passed_cases);
    let pass_rate = if total_cases == 0 {
        0.0
    } else {
        passed_cases as f64 / total_cases as f64
    };
    let intent_accuracy = if intent_cases == 0 {
        1.0
    } else {
        intent_hits as f64 / intent_cases as f64
    };

    let mut sorted_latencies = latency_ms.clone();
    sorted_latencies.sort_by(|a, b| a.total_cmp(b));
    let avg_latency_ms = if latency_ms.is_empty() {
        0.0
    } else {
        latency_ms.iter().sum::<f64>() / latency_ms.len() as f64
    };

    let passed_threshold = pass_rate >= fail_under.clamp(0.0, 1.0);
    Ok(EvalRunReport {
        generated_at_unix_ms: unix_ms_now(),
        dataset_name: dataset.name.clone(),
        dataset_version: dataset.version.clone(),
        dataset_description: dataset.description.clone(),
        total_cases,
        passed_cases,
        failed_cases,
        intent_accuracy: round_metric(intent_accuracy),
        pass_rate: round_metric(pass_rate),
        fail_under: round_metric(fail_under.clamp(0.0, 1.0)),
        passed_threshold,
        avg_latency_ms: round_metric(avg_latency_ms),
        p95_latency_ms: round_metric(percentile(&sorted_latencies, 95.0)),
        case_reports,
    })
}

pub fn write_eval_report(path: &str, report: &EvalRunReport) -> Result<()> {
    let path_buf = PathBuf::from(path);
    if let Some(parent) = path_buf.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create eval report directory '{}'",
                parent.display()
            )
        })?;
    }

    let payload =
        serde_json::to_string_pretty(report).context("failed to serialize eval report to json")?;
    std::fs::write(&path_buf, payload)
        .with_context(|| format!("failed to write eval report to '{}'", path_buf.display()))
}

pub async fn run_eval(
    dataset_path: Option<String>,
    output_path: Option<String>,
    reformulator: &RuleReformulator,
    fail_under: f64,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let dataset_path = dataset_path.unwrap_or_else(|| DEFAULT_EVAL_DATASET_PATH.to_string());
    let output_path = output_path.unwrap_or_else(|| DEFAULT_EVAL_OUTPUT_PATH.to_string());
    let dataset = load_eval_dataset(&dataset_path)?;
    let report = run_eval_harness(&dataset, reformulator, fail_under).await?;

    write_eval_report(&output_path, &report)?;
    telemetry.emit(
        "eval.completed",
        json!({
            "dataset": report.dataset_name,
            "dataset_version": report.dataset_version,
            "total_cases": report.total_cases,
            "pass_rate": report.pass_rate,
            "intent_accuracy": report.intent_accuracy,
            "passed_threshold": report.passed_threshold,
            "output_path": output_path
        }),
    );

    println!(
        "Eval completed: dataset={} version={} cases={} pass_rate={:.3} intent_accuracy={:.3} threshold={:.3}",
        report.dataset_name,
        report.dataset_version,
        report.total_cases,
        report.pass_rate,
        report.intent_accuracy,
        report.fail_under
    );
    for case in report.case_reports.iter().filter(|case| !case.passed) {
        println!(
            "- FAIL {}: intent={} (expected {}) terms={}/{} query='{}'",
            case.id,
            case.detected_intent,
            case.expected_intent.as_deref().unwrap_or("-"),
            case.matched_terms,
            case.required_terms,
            case.first_query
        );
    }
    println!("Report written to {}", output_path);

    if !report.passed_threshold {
        return Err(anyhow::anyhow!(
            "eval pass rate {:.3} is below threshold {:.3}",
            report.pass_rate,
            report.fail_under
        ));
    }

    Ok(())
}
