//! Health and status endpoints.
//!
//! - `GET /health`: liveness
//! - `GET /api/cursors`: every cursor with its position
//! - `GET /api/messages/count`: number of stored messages

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tracing::{info, warn};

use crate::store::{CursorStore, MessageStore};

/// State shared by the status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub cursors: Arc<dyn CursorStore>,
    pub messages: Arc<dyn MessageStore>,
}

/// Build the status router.
pub fn status_routes(cursors: Arc<dyn CursorStore>, messages: Arc<dyn MessageStore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/cursors", get(list_cursors))
        .route("/api/messages/count", get(count_messages))
        .with_state(StatusState { cursors, messages })
}

/// Serve the status router on `0.0.0.0:<port>` in the background.
pub fn spawn_status_server(
    port: u16,
    router: Router,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port, "Failed to bind status server: {e}");
                return;
            }
        };
        info!(port, "Status server started");
        if let Err(e) = axum::serve(listener, router).await {
            warn!("Status server stopped: {e}");
        }
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn list_cursors(State(state): State<StatusState>) -> impl IntoResponse {
    match state.cursors.list_cursors().await {
        Ok(cursors) => {
            let body: Vec<_> = cursors
                .into_iter()
                .map(|c| {
                    serde_json::json!({
                        "key": c.key,
                        "position": c.position,
                        "updated_at": c.updated_at,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!(body)))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn count_messages(State(state): State<StatusState>) -> impl IntoResponse {
    match state.messages.count_messages().await {
        Ok(count) => (StatusCode::OK, Json(serde_json::json!({"count": count}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}
