use anyhow::Result;

use crate::cli::SearchBackend;
use crate::config::{RuntimeConfig, display_api_base_url};
use crate::provider::{detect_provider, env_present};
use crate::retrieval::load_corpus;

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("OPENROUTER_API_KEY", env_present("OPENROUTER_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {:?}", provider),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export one provider key or run with --provider ollama");
        }
    }
    println!(
        "Model: {} (api_base_url: {}, timeout_secs: {})",
        cfg.model.as_deref().unwrap_or("<provider-default>"),
        display_api_base_url(cfg),
        cfg.model_timeout_secs
    );

    println!(
        "Search: backend={:?}, corpus_path={}, top_k={}, timeout_secs={}",
        cfg.search_backend,
        cfg.corpus_path.as_deref().unwrap_or("<not configured>"),
        cfg.search_top_k,
        cfg.search_timeout_secs
    );
    if let Some(path) = cfg.corpus_path.as_deref() {
        let documents = load_corpus(path)?;
        println!("Corpus check: ok ({} documents)", documents.len());
        if documents.is_empty() {
            println!("Tip: every request will escalate until the corpus has documents");
        }
    } else if !matches!(cfg.search_backend, SearchBackend::Disabled) {
        return Err(anyhow::anyhow!(
            "search backend {:?} requires --corpus-path or profile.corpus_path",
            cfg.search_backend
        ));
    } else {
        println!("Corpus check: skipped (search disabled; every request will escalate)");
    }

    let policy = cfg.confidence_policy();
    println!(
        "Confidence policy: acceptance_floor={:.1} usable_partial_floor={:.1} augmentation_accept_floor={:.1} max_attempts={} intents={} protected={}",
        policy.acceptance_floor(),
        policy.usable_partial_floor(),
        policy.augmentation_accept_floor(),
        policy.max_attempts(),
        policy.intent_thresholds().len(),
        policy.protected_intents().len()
    );
    let issues = policy.sanity_issues();
    if issues.is_empty() {
        println!("Policy check: ok");
    } else {
        return Err(anyhow::anyhow!(
            "confidence policy check failed: {}",
            issues.join("; ")
        ));
    }

    let contact_configured =
        cfg.contact.support_phone.is_some() || cfg.contact.support_url.is_some();
    println!(
        "Contact: company='{}' support_channel={} markers={}",
        cfg.contact.company_name,
        if contact_configured { "configured" } else { "missing" },
        cfg.contact_markers.len()
    );
    if !contact_configured {
        println!("Tip: set --support-phone or --support-url so escalations name a channel");
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}
