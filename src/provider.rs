use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::error::CollaboratorError;

/// Text completion collaborator used for scoring, reformulation and answer
/// generation. Output is treated as untrusted and possibly malformed.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> std::result::Result<String, CollaboratorError>;
}

/// Bounds a collaborator future; elapsed time becomes
/// [`CollaboratorError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    future: F,
) -> std::result::Result<T, CollaboratorError>
where
    F: Future<Output = std::result::Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout { operation, timeout }),
    }
}

/// `complete` with a deadline and empty-output rejection.
pub async fn complete_bounded(
    model: &dyn LanguageModel,
    operation: &'static str,
    prompt: &str,
    timeout: Duration,
) -> std::result::Result<String, CollaboratorError> {
    let text = with_timeout(operation, timeout, model.complete(prompt)).await?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CollaboratorError::EmptyResponse { operation });
    }
    Ok(trimmed.to_string())
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible endpoints (OpenAI,
/// OpenRouter, Ollama's `/v1` surface).
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl OpenAiCompatibleModel {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client for model provider")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            temperature: 0.1,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, CollaboratorError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let transport = |message: String| CollaboratorError::Transport {
            operation: "model.complete",
            message,
        };

        let response = request
            .send()
            .await
            .map_err(|err| transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(transport(format!(
                "status {}: {}",
                status.as_u16(),
                crate::request::truncate_chars(&body, 300)
            )));
        }

        let parsed = response
            .json::<ChatResponse>()
            .await
            .map_err(|err| transport(format!("invalid completion payload: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(CollaboratorError::EmptyResponse {
                operation: "model.complete",
            })
    }
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("OPENROUTER_API_KEY") {
        return Some(Provider::Openrouter);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Auto => "auto",
        Provider::Openai => "openai",
        Provider::Openrouter => "openrouter",
        Provider::Ollama => "ollama",
    }
}

pub fn resolve_model(cfg: &RuntimeConfig) -> Result<(Arc<dyn LanguageModel>, Provider, String)> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of OPENAI_API_KEY, OPENROUTER_API_KEY, \
             OLLAMA_HOST, or use --provider ollama",
        )?,
        p => p,
    };

    let (default_base, api_key, default_model) = match provider {
        Provider::Openai => (
            "https://api.openai.com/v1".to_string(),
            Some(
                std::env::var("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY is required for OpenAI provider")?,
            ),
            "gpt-4o-mini",
        ),
        Provider::Openrouter => (
            "https://openrouter.ai/api/v1".to_string(),
            Some(
                std::env::var("OPENROUTER_API_KEY")
                    .context("OPENROUTER_API_KEY is required for OpenRouter provider")?,
            ),
            "openai/gpt-4o-mini",
        ),
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            (format!("{host}/v1"), None, "llama3.1")
        }
        Provider::Auto => {
            return Err(anyhow::anyhow!(
                "provider auto-detection did not resolve a concrete provider"
            ));
        }
    };

    let base_url = cfg.api_base_url.clone().unwrap_or(default_base);
    let model_name = cfg
        .model
        .clone()
        .unwrap_or_else(|| default_model.to_string());
    if model_name.trim().is_empty() {
        return Err(anyhow::anyhow!(
            "model name cannot be empty for provider '{}'",
            provider_label(provider)
        ));
    }

    let model = OpenAiCompatibleModel::new(base_url, api_key, model_name.clone())?;
    Ok((Arc::new(model), provider, model_name))
}
