use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::level_filters::LevelFilter;

use evalrag::chat::{render_final_answer, run_chat};
use evalrag::cli::{
    Cli, Commands, EvalCommands, ProfileCommands, ServerCommands, TelemetryCommands,
    command_label,
};
use evalrag::config::{ProfilesFile, RuntimeConfig, load_profiles, resolve_runtime_config};
use evalrag::doctor::run_doctor;
use evalrag::error::{categorize_error, format_cli_error};
use evalrag::eval::run_eval;
use evalrag::profiles::{run_profiles_list, run_profiles_show};
use evalrag::provider::{provider_label, resolve_model};
use evalrag::reformulate::RuleReformulator;
use evalrag::retrieval::build_search_service;
use evalrag::server::run_server;
use evalrag::telemetry::{TelemetrySink, run_telemetry_report};
use evalrag::workflow::AnswerWorkflow;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn build_workflow(
    cfg: &RuntimeConfig,
    telemetry: &TelemetrySink,
    path: &str,
) -> Result<Arc<AnswerWorkflow>> {
    let search = build_search_service(cfg)?;
    tracing::info!(
        backend = search.backend_name(),
        top_k = cfg.search_top_k,
        "Using search backend"
    );
    let (model, resolved_provider, model_name) = resolve_model(cfg)?;
    tracing::info!(provider = ?resolved_provider, model = %model_name, "Using model");
    telemetry.emit(
        "model.resolved",
        json!({
            "provider": provider_label(resolved_provider),
            "model": model_name,
            "path": path
        }),
    );
    Ok(Arc::new(AnswerWorkflow::build(
        cfg,
        model,
        search,
        telemetry.clone(),
    )))
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let Some(command) = cli.command else {
        let telemetry = TelemetrySink::new(&cfg, "chat".to_string());
        let workflow = build_workflow(&cfg, &telemetry, "chat")?;
        return run_chat(&cfg, workflow, None, &telemetry).await;
    };

    let label = command_label(&command);
    let telemetry = TelemetrySink::new(&cfg, label.clone());
    telemetry.emit("command.started", json!({ "command": label }));

    let result = dispatch(command, &cfg, &profiles, &telemetry).await;
    match &result {
        Ok(()) => telemetry.emit("command.completed", json!({ "command": label })),
        Err(err) => telemetry.emit(
            "command.failed",
            json!({
                "command": label,
                "category": categorize_error(err).code(),
                "error": err.to_string()
            }),
        ),
    }
    result
}

async fn dispatch(
    command: Commands,
    cfg: &RuntimeConfig,
    profiles: &ProfilesFile,
    telemetry: &TelemetrySink,
) -> Result<()> {
    match command {
        Commands::Ask {
            query,
            intent,
            json,
        } => {
            let workflow = build_workflow(cfg, telemetry, "ask")?;
            let query = query.join(" ");
            let answer = workflow.answer(&query, intent.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer.view())?);
            } else {
                println!("{}", render_final_answer(&answer));
            }
        }
        Commands::Chat { intent } => {
            let workflow = build_workflow(cfg, telemetry, "chat")?;
            run_chat(cfg, workflow, intent, telemetry).await?;
        }
        Commands::Doctor => {
            run_doctor(cfg).await?;
        }
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(profiles, cfg)?,
            ProfileCommands::Show => run_profiles_show(cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(cfg, path, limit)?,
        },
        Commands::Eval { command } => match command {
            EvalCommands::Run {
                dataset,
                output,
                fail_under,
            } => {
                let reformulator =
                    RuleReformulator::new(cfg.topics.clone(), cfg.domain_terms.clone());
                run_eval(dataset, output, &reformulator, fail_under, telemetry).await?
            }
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { host, port } => {
                run_server(cfg.clone(), host, port, telemetry).await?
            }
        },
    }

    Ok(())
}
