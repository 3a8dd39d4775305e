//! Application state
//!
//! Holds all shared components and state

use crate::camera_manager::CameraManager;
use crate::config_store::ConfigStore;
use crate::detector_client::{FaceClient, RpcSettings, YoloClient, YoloTask};
use crate::event_store::{self, EventStore};
use crate::frame_distributor::{self, FrameDistributor};
use crate::motion_signal::MotionTracker;
use crate::pipeline::DetectionPipelineManager;
use crate::realtime_hub::{self, RealtimeHub};
use crate::stream_publisher::{BinarySocketPublisher, MultipartPublisher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Camera to activate at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupCamera {
    pub camera_id: String,
    pub source_url: Option<String>,
}

/// Parse `id` or `id=url` entries separated by commas
pub fn parse_startup_cameras(raw: &str) -> Vec<StartupCamera> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once('=') {
            Some((id, url)) => {
                let id = id.trim();
                let url = url.trim();
                (!id.is_empty()).then(|| StartupCamera {
                    camera_id: id.to_string(),
                    source_url: (!url.is_empty()).then(|| url.to_string()),
                })
            }
            None => Some(StartupCamera {
                camera_id: entry.to_string(),
                source_url: None,
            }),
        })
        .collect()
}

/// Parse a comma list of YOLO tasks, skipping unknown entries
pub fn parse_yolo_tasks(raw: &str) -> Vec<YoloTask> {
    let tasks: Vec<YoloTask> = raw
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .filter_map(|t| match t.parse() {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(task = %t, error = %e, "Ignoring YOLO task");
                None
            }
        })
        .collect();
    if tasks.is_empty() {
        vec![YoloTask::Detect]
    } else {
        tasks
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Object detector gRPC endpoint
    pub yolo_url: String,
    /// Face recognizer gRPC endpoint, face detection disabled when unset
    pub face_url: Option<String>,
    pub yolo_tasks: Vec<YoloTask>,
    pub rpc_send_timeout: Duration,
    pub rpc_response_timeout: Duration,
    pub rpc_health_ttl: Duration,
    pub rpc_health_timeout: Duration,
    /// Per-subscriber queue depth at the distributor
    pub subscriber_queue_depth: usize,
    /// Per-viewer queue depth at the stream publishers
    pub viewer_queue_depth: usize,
    pub viewer_write_timeout: Duration,
    /// Per-client queue depth at the dashboard hub
    pub hub_queue_depth: usize,
    /// How long after an annotated frame auto viewers skip raw frames
    pub detection_active_window: Duration,
    pub event_capacity: usize,
    /// TTF font used for overlay labels
    pub overlay_font_path: Option<PathBuf>,
    pub frame_poll_interval: Duration,
    pub startup_cameras: Vec<StartupCamera>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let yolo_tasks = std::env::var("YOLO_TASKS")
            .map(|v| parse_yolo_tasks(&v))
            .unwrap_or_else(|_| vec![YoloTask::Detect]);

        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8080),
            yolo_url: std::env::var("YOLO_GRPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:50051".to_string()),
            face_url: std::env::var("FACE_GRPC_URL").ok().filter(|v| !v.is_empty()),
            yolo_tasks,
            rpc_send_timeout: Duration::from_millis(env_or("RPC_SEND_TIMEOUT_MS", 100)),
            rpc_response_timeout: Duration::from_millis(env_or("RPC_RESPONSE_TIMEOUT_MS", 500)),
            rpc_health_ttl: Duration::from_secs(env_or("RPC_HEALTH_TTL_SECS", 30)),
            rpc_health_timeout: Duration::from_millis(env_or("RPC_HEALTH_TIMEOUT_MS", 1000)),
            subscriber_queue_depth: env_or("SUBSCRIBER_QUEUE_DEPTH", frame_distributor::DEFAULT_QUEUE_DEPTH),
            viewer_queue_depth: env_or("VIEWER_QUEUE_DEPTH", 5),
            viewer_write_timeout: Duration::from_millis(env_or("VIEWER_WRITE_TIMEOUT_MS", 100)),
            hub_queue_depth: env_or("HUB_QUEUE_DEPTH", realtime_hub::DEFAULT_CLIENT_QUEUE_DEPTH),
            detection_active_window: Duration::from_millis(env_or("DETECTION_ACTIVE_WINDOW_MS", 5000)),
            event_capacity: env_or("EVENT_CAPACITY", event_store::DEFAULT_CAPACITY),
            overlay_font_path: std::env::var("OVERLAY_FONT_PATH").ok().map(PathBuf::from),
            frame_poll_interval: Duration::from_millis(env_or("FRAME_POLL_INTERVAL_MS", 500)),
            startup_cameras: std::env::var("CAMERAS")
                .map(|v| parse_startup_cameras(&v))
                .unwrap_or_default(),
        }
    }
}

impl AppConfig {
    pub fn rpc_settings(&self) -> RpcSettings {
        RpcSettings {
            send_timeout: self.rpc_send_timeout,
            response_timeout: self.rpc_response_timeout,
            health_ttl: self.rpc_health_ttl,
            health_timeout: self.rpc_health_timeout,
            ..RpcSettings::default()
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub distributor: Arc<FrameDistributor>,
    pub config_store: Arc<ConfigStore>,
    pub motion: Arc<MotionTracker>,
    pub yolo: Arc<YoloClient>,
    pub face: Option<Arc<FaceClient>>,
    pub events: Arc<dyn EventStore>,
    pub realtime: Arc<RealtimeHub>,
    pub pipeline: Arc<DetectionPipelineManager>,
    pub multipart: Arc<MultipartPublisher>,
    pub binary_socket: Arc<BinarySocketPublisher>,
    pub cameras: Arc<CameraManager>,
    pub started_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_startup_cameras() {
        let cameras = parse_startup_cameras(" cam1, cam2=http://10.0.0.5/snap.jpg ,,=x, cam3= ");
        assert_eq!(
            cameras,
            vec![
                StartupCamera {
                    camera_id: "cam1".to_string(),
                    source_url: None,
                },
                StartupCamera {
                    camera_id: "cam2".to_string(),
                    source_url: Some("http://10.0.0.5/snap.jpg".to_string()),
                },
                StartupCamera {
                    camera_id: "cam3".to_string(),
                    source_url: None,
                },
            ]
        );
    }

    #[test]
    fn test_parse_yolo_tasks() {
        assert_eq!(parse_yolo_tasks("detect, pose"), vec![YoloTask::Detect, YoloTask::Pose]);
        assert_eq!(parse_yolo_tasks("bogus"), vec![YoloTask::Detect]);
        assert_eq!(parse_yolo_tasks(""), vec![YoloTask::Detect]);
    }
}
