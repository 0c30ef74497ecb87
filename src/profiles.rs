use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_api_base_url};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "<none>".to_string()
    } else {
        items.join(", ")
    }
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    let policy = cfg.confidence_policy();

    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {:?}", cfg.provider);
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("API base URL: {}", display_api_base_url(cfg));
    println!("Search backend: {:?}", cfg.search_backend);
    println!(
        "Corpus path: {}",
        cfg.corpus_path.as_deref().unwrap_or("<not configured>")
    );
    println!("Search top_k: {}", cfg.search_top_k);
    println!(
        "Timeouts (secs): search={} model={}",
        cfg.search_timeout_secs, cfg.model_timeout_secs
    );
    println!("Reformulation: {:?}", cfg.reformulation);
    println!(
        "Topic rules: {}",
        list_or_none(
            &cfg.topics
                .iter()
                .map(|topic| topic.name.clone())
                .collect::<Vec<String>>()
        )
    );
    println!("Domain terms: {}", cfg.domain_terms);
    println!("Intent model refinement: {}", cfg.intent_model_refinement);

    println!(
        "Confidence policy: acceptance_floor={:.1} usable_partial_floor={:.1} augmentation_accept_floor={:.1} max_attempts={}",
        policy.acceptance_floor(),
        policy.usable_partial_floor(),
        policy.augmentation_accept_floor(),
        policy.max_attempts()
    );
    println!("Intent thresholds:");
    for (intent, threshold) in policy.intent_thresholds() {
        let protected = if policy.is_protected(intent) {
            " (protected)"
        } else {
            ""
        };
        println!("  {intent}: {threshold:.1}{protected}");
    }
    println!(
        "Protected intents: {}",
        list_or_none(&policy.protected_intents().iter().cloned().collect::<Vec<String>>())
    );
    let issues = policy.sanity_issues();
    if !issues.is_empty() {
        println!("Policy issues:");
        for issue in issues {
            println!("  - {issue}");
        }
    }

    println!(
        "Evaluation context: documents={} excerpt_chars={}",
        cfg.eval_max_documents, cfg.eval_excerpt_chars
    );
    println!(
        "Augmentation context: documents={} excerpt_chars={}",
        cfg.augmentation_max_documents, cfg.augmentation_excerpt_chars
    );
    println!(
        "Answer length bounds: {}-{} chars",
        cfg.answer_min_chars, cfg.answer_max_chars
    );
    println!("Contact markers: {}", list_or_none(&cfg.contact_markers));
    println!(
        "Contact: company='{}' phone={} url={} hours={}",
        cfg.contact.company_name,
        cfg.contact.support_phone.as_deref().unwrap_or("<none>"),
        cfg.contact.support_url.as_deref().unwrap_or("<none>"),
        cfg.contact.support_hours.as_deref().unwrap_or("<none>")
    );
    println!("Max query chars: {}", cfg.max_query_chars);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
