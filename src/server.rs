use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::eval::round_metric;
use crate::provider::{provider_label, resolve_model};
use crate::request::AnswerView;
use crate::retrieval::build_search_service;
use crate::telemetry::TelemetrySink;
use crate::workflow::AnswerWorkflow;

pub const SERVER_AUTH_TOKEN_ENV: &str = "EVALRAG_SERVER_AUTH_TOKEN";

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub workflow: Arc<AnswerWorkflow>,
    pub telemetry: TelemetrySink,
    pub search_backend: String,
    pub provider_label: String,
    pub model_name: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub search_backend: String,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerAskRequest {
    pub query: String,
    pub intent: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerAskResponse {
    #[serde(flatten)]
    pub answer: AnswerView,
    pub latency_ms: f64,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn server_auth_token_from_env() -> Option<String> {
    std::env::var(SERVER_AUTH_TOKEN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        search_backend: state.search_backend.clone(),
        provider: state.provider_label.clone(),
        model: state.model_name.clone(),
    })
}

pub async fn handle_server_ask(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ServerAskRequest>,
) -> ApiResult<ServerAskResponse> {
    check_server_auth(&state, &headers)?;
    let started_at = Instant::now();

    let query = request.query.trim();
    if query.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "query cannot be empty for /v1/ask",
        ));
    }
    if query.chars().count() > state.cfg.max_query_chars {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "query exceeds the {} character limit",
                state.cfg.max_query_chars
            ),
        ));
    }

    let answer = state
        .workflow
        .answer(query, request.intent.as_deref())
        .await
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let latency_ms = round_metric(started_at.elapsed().as_secs_f64() * 1000.0);

    state.telemetry.emit(
        "server.ask.completed",
        json!({
            "request_id": answer.request_id,
            "provenance": answer.provenance.label(),
            "latency_ms": latency_ms,
        }),
    );

    Ok(Json(ServerAskResponse {
        answer: answer.view(),
        latency_ms,
    }))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/ask", post(handle_server_ask))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let search = build_search_service(&cfg)?;
    let (model, resolved_provider, model_name) = resolve_model(&cfg)?;
    let provider = provider_label(resolved_provider).to_string();
    telemetry.emit(
        "model.resolved",
        json!({
            "provider": provider.clone(),
            "model": model_name.clone(),
            "path": "server"
        }),
    );

    let search_backend = search.backend_name().to_string();
    let workflow = Arc::new(AnswerWorkflow::build(&cfg, model, search, telemetry.clone()));
    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        workflow,
        telemetry: telemetry.clone(),
        search_backend: search_backend.clone(),
        provider_label: provider.clone(),
        model_name: model_name.clone(),
        auth_token: server_auth_token_from_env(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "search_backend": search_backend,
            "provider": provider,
            "model": model_name,
            "auth": state.auth_token.is_some()
        }),
    );

    println!(
        "Server mode listening on http://{} (health: /healthz, ask: /v1/ask)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
