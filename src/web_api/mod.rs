//! WebAPI - HTTP / WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - Camera activation, frame ingest and motion reports
//! - Detection config and detector runtime settings
//! - Event playback
//! - Live viewer streams (multipart, binary socket) and the dashboard hub

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let yolo_healthy = state.yolo.health().await.is_healthy();
    let face_healthy = match &state.face {
        Some(face) => Some(face.health().await.is_healthy()),
        None => None,
    };

    let response = HealthResponse {
        status: if yolo_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        yolo_healthy,
        face_healthy,
        active_cameras: state.cameras.active_count().await,
    };

    Json(response)
}
