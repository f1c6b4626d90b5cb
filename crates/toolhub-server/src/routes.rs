use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Error body in the `{"detail": ...}` shape clients of the chat API expect.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.orchestrator.lock().await.sessions().len();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
    }))
}

// ── Chat ────────────────────────────────────────────────────────────────

pub fn chat_routes() -> Router<AppState> {
    Router::new().route("/chat", post(chat))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let mut orchestrator = state.orchestrator.lock().await;

    if !orchestrator.has_sessions() {
        return Err(ApiError::internal("No tool providers connected"));
    }

    info!("Processing chat query ({} chars)", req.query.len());
    let response = orchestrator.process_query(&req.query).await.map_err(|e| {
        warn!("Chat query failed: {}", e);
        ApiError::internal(e.to_string())
    })?;

    Ok(Json(ChatResponse { response }))
}

// ── Tools ───────────────────────────────────────────────────────────────

pub fn tool_routes() -> Router<AppState> {
    Router::new().route("/tools", get(list_tools))
}

#[derive(Debug, Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    provider: Option<String>,
}

async fn list_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = state.orchestrator.lock().await;
    let registry = orchestrator.registry();

    let tools: Vec<ToolInfo> = registry
        .tools_for_model()
        .into_iter()
        .map(|tool| ToolInfo {
            provider: registry.resolve(&tool.name).map(str::to_string),
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        })
        .collect();

    Json(json!({ "tools": tools }))
}
