use crate::config::{AppState, ServerConfig};
use crate::{ui, websocket};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rustmake_core::actions::CredentialSet;
use rustmake_core::{CredentialRef, GraphError, RunError, WorkflowSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // API routes
        .route("/api/health", get(health_check))
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/api/workflows/{workflow_id}", get(handlers::get_workflow))
        .route("/api/workflows/{workflow_id}/runs", post(handlers::start_stored_run))
        .route("/api/keys", get(handlers::list_keys).post(handlers::put_key))
        .route("/api/runs", post(handlers::start_inline_run))
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/cancel", post(handlers::cancel_run))
        .route("/api/runs/{run_id}/summary", get(handlers::get_run_summary))
        // Realtime execution channel
        .route("/api/ws", get(websocket::ws_handler))
        // UI routes
        .fallback(ui::serve_ui)
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "rustmake",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// A credential supplied inline with a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyInput {
    pub service: String,
    #[serde(alias = "value")]
    pub key_value: String,
}

impl From<ApiKeyInput> for CredentialRef {
    fn from(input: ApiKeyInput) -> Self {
        CredentialRef::new(input.service, input.key_value)
    }
}

/// Parse an inline `{ name?, nodes }` document and the keys sent with it
pub fn parse_inline_workflow(
    workflow: serde_json::Value,
    api_keys: Vec<ApiKeyInput>,
) -> Result<(WorkflowSpec, CredentialSet), GraphError> {
    let spec = WorkflowSpec::from_value("", workflow)?;
    let credentials = CredentialSet::new(api_keys.into_iter().map(CredentialRef::from));
    Ok((spec, credentials))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError {
    status: Option<StatusCode>,
    error: anyhow::Error,
}

impl ApiError {
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: anyhow::anyhow!(message.into()),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| status_for(&self.error))
    }

    pub fn body(&self) -> ErrorResponse {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        }
    }
}

/// Status code for domain errors; anything unrecognised is a 500
fn status_for(error: &anyhow::Error) -> StatusCode {
    if let Some(run_error) = error.downcast_ref::<RunError>() {
        return match run_error {
            RunError::Graph(_) => StatusCode::BAD_REQUEST,
            RunError::RunNotFound { .. } | RunError::WorkflowNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RunError::RunAlreadyFinished { .. } => StatusCode::CONFLICT,
            RunError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if error.downcast_ref::<GraphError>().is_some() {
        return StatusCode::BAD_REQUEST;
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }
        (status, Json(self.body())).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: None,
            error: err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
