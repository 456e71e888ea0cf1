use crate::api::ErrorResponse;
use crate::config::AppState;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile};

/// Serve the frontend from the configured static directory
pub async fn serve_ui(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let path = request.uri().path().trim_start_matches('/').to_string();

    // Unknown API routes get a JSON 404, never the frontend
    if path.starts_with("api/") || path == "api" {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("no route for /{}", path))),
        )
            .into_response();
    }

    let static_dir = &state.config.ui.static_dir;
    let index = static_dir.join("index.html");

    // For SPA routing, unknown paths serve index.html
    let service = ServeDir::new(static_dir).fallback(ServeFile::new(&index));
    match service.oneshot(request).await {
        Ok(response) if response.status() != StatusCode::NOT_FOUND => response.into_response(),
        _ => placeholder(),
    }
}

// Fallback: show a placeholder page
fn placeholder() -> Response {
    (
        StatusCode::OK,
        Html(
            "<!doctype html><html><head><title>RustMake</title></head>\
             <body><h1>RustMake</h1><p>No frontend installed. The API is served under <code>/api</code>.</p></body></html>",
        ),
    )
        .into_response()
}
