use std::time::Duration;

/// Failure of a call to an external collaborator (search backend or language
/// model). Callers decide whether it is soft or hard.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{operation} transport error: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} returned an empty response")]
    EmptyResponse { operation: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Retrieval,
    Policy,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Retrieval => "RETRIEVAL",
            ErrorCategory::Policy => "POLICY",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set provider credentials (for example OPENAI_API_KEY) or run with --provider ollama."
            }
            ErrorCategory::Retrieval => {
                "Check --search-backend/--corpus-path and that the corpus file is readable."
            }
            ErrorCategory::Policy => {
                "Review intent_thresholds/protected_intents in the active profile; run evalrag doctor."
            }
            ErrorCategory::Input => "Run evalrag --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("threshold") || msg.contains("protected") || msg.contains("policy") {
        return ErrorCategory::Policy;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
        || msg.contains("query cannot be empty")
        || msg.contains("character limit")
        || msg.contains("the limit is")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("corpus") || msg.contains("search") || msg.contains("retrieval") {
        return ErrorCategory::Retrieval;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    if show_sensitive_config {
        format!("{err:#}")
    } else {
        redact_sensitive_text(&format!("{err:#}"))
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    redact_api_keys(text)
}

/// Masks bearer tokens and `sk-` style API keys that providers echo back in
/// error bodies.
pub fn redact_api_keys(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (index, token) in text.split(' ').enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&redact_api_key_value(token));
    }
    out
}

pub fn redact_api_key_value(value: &str) -> String {
    let trimmed = value.trim_matches(|ch: char| matches!(ch, '"' | '\'' | ',' | ';'));
    if (trimmed.starts_with("sk-") || trimmed.starts_with("sk_")) && trimmed.len() > 8 {
        value.replace(trimmed, "sk-[REDACTED]")
    } else {
        value.to_string()
    }
}
