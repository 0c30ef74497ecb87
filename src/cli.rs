use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Openrouter,
    Ollama,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    Disabled,
    Local,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReformulationStrategy {
    Rules,
    Model,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings and policy")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize answer outcomes from a telemetry JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum EvalCommands {
    #[command(about = "Run the offline intent/retrieval eval dataset and emit a report")]
    Run {
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        output: Option<String>,
        #[arg(long, default_value_t = 0.80)]
        fail_under: f64,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServerCommands {
    #[command(about = "Run HTTP server mode for health and ask endpoints")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  evalrag --corpus-path kb/documents.json ask \"How do I lower nitrates in a reef tank?\"\n\
  evalrag --search-backend local --corpus-path kb/notes.txt ask --intent dosage \"Dosage for 300L\"\n\
  evalrag --provider ollama --model llama3.1 chat\n\
  evalrag --reformulation model ask \"Which salt should I use for SPS corals?\"\n\
  evalrag server serve --host 127.0.0.1 --port 8787\n\
  evalrag eval run --fail-under 0.90\n\
  evalrag telemetry report --limit 2000\n\
  evalrag profiles show\n\
\n\
Outcome provenance:\n\
  direct, augmented, escalated, business, trade_secret\n\
  (dosage questions without a confident answer escalate to packaging instructions)";

#[derive(Debug, Parser)]
#[command(name = "evalrag")]
#[command(about = "Confidence-driven retrieval and augmentation for domain questions")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "EVALRAG_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "EVALRAG_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "EVALRAG_API_BASE_URL")]
    pub api_base_url: Option<String>,

    #[arg(long, env = "EVALRAG_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "EVALRAG_CONFIG", default_value = ".evalrag/config.toml")]
    pub config_path: String,

    #[arg(long, env = "EVALRAG_SEARCH_BACKEND", value_enum)]
    pub search_backend: Option<SearchBackend>,

    #[arg(long, env = "EVALRAG_CORPUS_PATH")]
    pub corpus_path: Option<String>,

    #[arg(long, env = "EVALRAG_SEARCH_TOP_K")]
    pub search_top_k: Option<usize>,

    #[arg(long, env = "EVALRAG_REFORMULATION", value_enum)]
    pub reformulation: Option<ReformulationStrategy>,

    #[arg(long, env = "EVALRAG_MODEL_TIMEOUT_SECS")]
    pub model_timeout_secs: Option<u64>,

    #[arg(long, env = "EVALRAG_SEARCH_TIMEOUT_SECS")]
    pub search_timeout_secs: Option<u64>,

    #[arg(long, env = "EVALRAG_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "EVALRAG_SUPPORT_PHONE")]
    pub support_phone: Option<String>,

    #[arg(long, env = "EVALRAG_SUPPORT_URL")]
    pub support_url: Option<String>,

    #[arg(long, env = "EVALRAG_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "EVALRAG_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "EVALRAG_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Answer one question and print the final answer")]
    Ask {
        #[arg(required = true)]
        query: Vec<String>,
        /// Skip classification and use this intent label.
        #[arg(long)]
        intent: Option<String>,
        /// Print the full final answer record as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    #[command(about = "Run interactive question mode")]
    Chat {
        #[arg(long)]
        intent: Option<String>,
    },
    #[command(about = "Validate provider environment, corpus and policy configuration")]
    Doctor,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
    #[command(about = "Offline evaluation harness")]
    Eval {
        #[command(subcommand)]
        command: EvalCommands,
    },
    #[command(about = "Server mode")]
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Chat { .. } => "chat".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
        Commands::Eval { command } => match command {
            EvalCommands::Run { .. } => "eval.run".to_string(),
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { .. } => "server.serve".to_string(),
        },
    }
}
