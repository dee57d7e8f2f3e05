//! Health check endpoint.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Sagas executing in this process.
    pub active_sagas: usize,
    /// Downloads transferring in this process.
    pub active_downloads: usize,
    /// Transcode runs in this process.
    pub active_transcodes: usize,
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sagas: state.orchestrator.active_count(),
        active_downloads: state.downloads.active_count(),
        active_transcodes: state.transcodes.active_count(),
    })
}

/// Returns the health check router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
