//! API Routes

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config_store::{CameraDetectionConfig, GlobalDetectionConfig, YoloRuntimeConfig};
use crate::error::Error;
use crate::frame_distributor::{CaptureStats, PublishOutcome};
use crate::frame_source::is_jpeg;
use crate::models::ApiResponse;
use crate::pipeline::PipelineStats;
use crate::state::AppState;
use crate::stream_publisher::{ClientMode, StreamPublisher, ViewerStats};

/// Largest accepted ingest body
const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Cameras
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/:id/activate", post(activate_camera))
        .route("/api/cameras/:id/deactivate", post(deactivate_camera))
        .route(
            "/api/cameras/:id/frames",
            post(ingest_frame).layer(DefaultBodyLimit::max(MAX_FRAME_BODY)),
        )
        .route("/api/cameras/:id/motion", post(report_motion))
        .route("/api/cameras/:id/stats", get(camera_stats))
        // Detection config
        .route(
            "/api/detection-config",
            get(get_global_config).put(update_global_config),
        )
        .route(
            "/api/cameras/:id/detection-config",
            get(get_camera_config)
                .put(update_camera_config)
                .delete(clear_camera_config),
        )
        // Detectors
        .route("/api/detectors/yolo/config", get(get_yolo_config))
        .route("/api/detectors/yolo/config", put(update_yolo_config))
        .route("/api/detectors/stats", get(detector_stats))
        // Events
        .route("/api/events", get(list_events))
        .route("/api/events/camera/:id", get(camera_events))
        // Live streams
        .route("/video/stream/:id", get(multipart_stream))
        .route("/ws/video/:id", get(video_socket_auto))
        .route("/ws/video/raw/:id", get(video_socket_raw))
        // Dashboard hub
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Camera Handlers
// ========================================

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let cameras = state.cameras.list().await;
    Json(ApiResponse::success(cameras))
}

#[derive(Debug, Default, Deserialize)]
struct ActivateRequest {
    source_url: Option<String>,
}

/// Body is optional: `{"source_url": "http://..."}` enables HTTP polling
async fn activate_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let req: ActivateRequest = if body.is_empty() {
        ActivateRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => return Error::InvalidConfig(format!("activate body: {}", e)).into_response(),
        }
    };

    match state.cameras.activate(&id, req.source_url.as_deref()).await {
        Ok(activated) => Json(ApiResponse::success(json!({
            "camera_id": id,
            "activated": activated,
        })))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn deactivate_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let deactivated = state.cameras.deactivate(&id).await;
    Json(ApiResponse::success(json!({
        "camera_id": id,
        "deactivated": deactivated,
    })))
}

/// Raw JPEG body from an external capture adapter
async fn ingest_frame(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if !is_jpeg(&body) {
        return Error::InvalidConfig("frame body is not a JPEG".to_string()).into_response();
    }

    match state.distributor.publish_jpeg(&id, body).await {
        PublishOutcome::Delivered { delivered, dropped } => Json(ApiResponse::success(json!({
            "delivered": delivered,
            "dropped": dropped,
        })))
        .into_response(),
        PublishOutcome::UnknownCamera => {
            Error::NotFound(format!("camera {}", id)).into_response()
        }
        PublishOutcome::OutOfOrder { last_sequence } => Error::InvalidConfig(format!(
            "frame out of order, last sequence {}",
            last_sequence
        ))
        .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MotionReport {
    #[serde(default)]
    active: bool,
    /// Compared against the camera's motion sensitivity when present
    score: Option<f32>,
}

async fn report_motion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<MotionReport>,
) -> impl IntoResponse {
    if !state.cameras.is_active(&id).await {
        return Error::NotFound(format!("camera {}", id)).into_response();
    }

    let active = match report.score {
        Some(score) => {
            let config = state.config_store.snapshot(&id).await;
            state
                .motion
                .report_score(&id, score, config.motion_sensitivity)
                .await
        }
        None => {
            state.motion.report(&id, report.active).await;
            report.active
        }
    };

    Json(ApiResponse::success(json!({ "camera_id": id, "active": active }))).into_response()
}

#[derive(Debug, Serialize)]
struct CameraStatsResponse {
    capture: CaptureStats,
    pipeline: Option<PipelineStats>,
    viewers: Vec<ViewerStats>,
}

async fn camera_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let capture = match state.distributor.stats(&id).await {
        Ok(capture) => capture,
        Err(e) => return e.into_response(),
    };
    let pipeline = state.pipeline.stats(&id).await.ok();

    let mut viewers = Vec::new();
    if let Some(stats) = state.multipart.stats(&id).await {
        viewers.push(stats);
    }
    if let Some(stats) = state.binary_socket.stats(&id).await {
        viewers.push(stats);
    }

    Json(ApiResponse::success(CameraStatsResponse {
        capture,
        pipeline,
        viewers,
    }))
    .into_response()
}

// ========================================
// Detection Config Handlers
// ========================================

async fn get_global_config(State(state): State<AppState>) -> impl IntoResponse {
    let global = state.config_store.global().await;
    Json(ApiResponse::success((*global).clone()))
}

async fn update_global_config(
    State(state): State<AppState>,
    Json(config): Json<GlobalDetectionConfig>,
) -> impl IntoResponse {
    match state.config_store.update_global(config).await {
        Ok(updated) => Json(ApiResponse::success((*updated).clone())).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_camera_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let overrides = state.config_store.camera_overrides(&id).await;
    let effective = state.config_store.snapshot(&id).await;
    Json(ApiResponse::success(json!({
        "overrides": overrides,
        "effective": *effective,
    })))
}

async fn update_camera_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<CameraDetectionConfig>,
) -> impl IntoResponse {
    match state.config_store.update_camera(&id, config).await {
        Ok(effective) => Json(ApiResponse::success((*effective).clone())).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn clear_camera_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let cleared = state.config_store.clear_camera(&id).await;
    Json(ApiResponse::success(json!({ "camera_id": id, "cleared": cleared })))
}

// ========================================
// Detector Handlers
// ========================================

async fn get_yolo_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.config_store.yolo_runtime().await))
}

/// Push runtime parameters to the object detector, then store the acked values
async fn update_yolo_config(
    State(state): State<AppState>,
    Json(config): Json<YoloRuntimeConfig>,
) -> impl IntoResponse {
    let applied = match state.yolo.configure(&config).await {
        Ok(applied) => applied,
        Err(e) => return e.into_response(),
    };
    match state.config_store.apply_yolo_runtime(applied).await {
        Ok(stored) => Json(ApiResponse::success(stored)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn detector_stats(State(state): State<AppState>) -> impl IntoResponse {
    let yolo = state.yolo.stats().await;
    let face = match &state.face {
        Some(face) => Some(face.stats().await),
        None => None,
    };
    Json(ApiResponse::success(json!({ "yolo": yolo, "face": face })))
}

// ========================================
// Event Handlers
// ========================================

#[derive(Deserialize)]
struct EventQuery {
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100);
    let events = state.events.latest(limit).await;
    Json(ApiResponse::success(events))
}

async fn camera_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100);
    let events = state.events.by_camera(&id, limit).await;
    Json(ApiResponse::success(events))
}

// ========================================
// Live Stream Handlers
// ========================================

async fn multipart_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let viewer = match state.multipart.connect(&id).await {
        Ok(viewer) => viewer,
        Err(e) => return e.into_response(),
    };
    match viewer.into_response() {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn video_socket_auto(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    video_socket(ws, state, id, ClientMode::Auto).await
}

async fn video_socket_raw(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    video_socket(ws, state, id, ClientMode::RawOnly).await
}

/// Register before upgrading so an unknown camera gets a 404, not a socket
async fn video_socket(
    ws: WebSocketUpgrade,
    state: AppState,
    camera_id: String,
    mode: ClientMode,
) -> axum::response::Response {
    let viewer = match state.binary_socket.connect(&camera_id, mode).await {
        Ok(viewer) => viewer,
        Err(e) => return e.into_response(),
    };
    let publisher = state.binary_socket.clone();
    ws.on_upgrade(move |socket| publisher.serve(socket, viewer))
}

// ========================================
// Dashboard Hub
// ========================================

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let (conn_id, rx) = state.realtime.register().await;

    let hub = state.realtime.clone();
    let mut send_task = tokio::spawn(async move { hub.forward(conn_id, rx, sender).await });

    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.realtime.unregister(&conn_id).await;
}
