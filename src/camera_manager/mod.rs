//! CameraManager - Camera Activation Lifecycle
//!
//! ## Responsibilities
//!
//! - Activate a camera: distributor channel, stream publishers, detection
//!   pipeline and (optionally) an HTTP frame source
//! - Deactivate in a fixed order so every task ends and every channel closes
//! - Report active cameras with their capture and pipeline state
//!
//! ## Design Principles
//!
//! - Activation and deactivation are idempotent
//! - One lock guards the camera table, so activate and deactivate of the same
//!   camera never interleave

use crate::error::{Error, Result};
use crate::frame_distributor::{CaptureStats, FrameDistributor};
use crate::frame_source::HttpFrameSource;
use crate::motion_signal::MotionTracker;
use crate::pipeline::DetectionPipelineManager;
use crate::realtime_hub::{CameraStatusMessage, HubMessage, RealtimeHub};
use crate::stream_publisher::StreamPublisher;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct ActiveCamera {
    source_url: Option<String>,
    activated_at: DateTime<Utc>,
    poller: Option<JoinHandle<()>>,
}

/// Active camera summary
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub camera_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub activated_at: DateTime<Utc>,
    pub pipeline_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureStats>,
}

/// CameraManager instance
pub struct CameraManager {
    distributor: Arc<FrameDistributor>,
    pipeline: Arc<DetectionPipelineManager>,
    publishers: Vec<Arc<dyn StreamPublisher>>,
    motion: Arc<MotionTracker>,
    hub: Arc<RealtimeHub>,
    source: Option<HttpFrameSource>,
    poll_interval: Duration,
    cameras: RwLock<HashMap<String, ActiveCamera>>,
}

impl CameraManager {
    pub fn new(
        distributor: Arc<FrameDistributor>,
        pipeline: Arc<DetectionPipelineManager>,
        publishers: Vec<Arc<dyn StreamPublisher>>,
        motion: Arc<MotionTracker>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self {
            distributor,
            pipeline,
            publishers,
            motion,
            hub,
            source: None,
            poll_interval: crate::frame_source::DEFAULT_POLL_INTERVAL,
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Enable `source_url` support on activation
    pub fn with_frame_source(mut self, source: HttpFrameSource, poll_interval: Duration) -> Self {
        self.source = Some(source);
        self.poll_interval = poll_interval;
        self
    }

    /// Activate a camera. Returns false if it was already active.
    ///
    /// Without a `source_url` the camera is fed through the ingest API.
    pub async fn activate(&self, camera_id: &str, source_url: Option<&str>) -> Result<bool> {
        if camera_id.trim().is_empty() {
            return Err(Error::InvalidConfig("camera_id must not be empty".to_string()));
        }
        if source_url.is_some() && self.source.is_none() {
            return Err(Error::InvalidConfig("frame source polling is not available".to_string()));
        }

        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(camera_id) {
            return Ok(false);
        }

        self.distributor.register_camera(camera_id).await;
        if let Err(e) = self.attach_consumers(camera_id).await {
            tracing::error!(camera_id = %camera_id, error = %e, "Camera activation failed, rolling back");
            self.teardown(camera_id, None).await;
            return Err(e);
        }

        let poller = match (source_url, &self.source) {
            (Some(url), Some(source)) => Some(source.spawn(camera_id, url, self.poll_interval)),
            _ => None,
        };

        cameras.insert(
            camera_id.to_string(),
            ActiveCamera {
                source_url: source_url.map(str::to_string),
                activated_at: Utc::now(),
                poller,
            },
        );
        drop(cameras);

        tracing::info!(camera_id = %camera_id, source = ?source_url, "Camera activated");
        self.broadcast_status(camera_id, true, source_url).await;
        Ok(true)
    }

    async fn attach_consumers(&self, camera_id: &str) -> Result<()> {
        for publisher in &self.publishers {
            publisher.attach(camera_id).await?;
        }
        self.pipeline.start(camera_id).await?;
        Ok(())
    }

    /// Deactivate a camera. Calling it for an inactive camera is a no-op.
    pub async fn deactivate(&self, camera_id: &str) -> bool {
        let mut cameras = self.cameras.write().await;
        let Some(camera) = cameras.remove(camera_id) else {
            return false;
        };

        self.teardown(camera_id, camera.poller).await;
        drop(cameras);
        tracing::info!(camera_id = %camera_id, "Camera deactivated");
        self.broadcast_status(camera_id, false, camera.source_url.as_deref())
            .await;
        true
    }

    /// Source first, then consumers, then the channel itself
    async fn teardown(&self, camera_id: &str, poller: Option<JoinHandle<()>>) {
        if let Some(poller) = poller {
            poller.abort();
        }
        self.pipeline.stop(camera_id).await;
        for publisher in &self.publishers {
            publisher.detach(camera_id).await;
        }
        self.distributor.deactivate_camera(camera_id).await;
        self.motion.remove(camera_id).await;
    }

    pub async fn is_active(&self, camera_id: &str) -> bool {
        self.cameras.read().await.contains_key(camera_id)
    }

    pub async fn list(&self) -> Vec<CameraInfo> {
        let entries: Vec<(String, Option<String>, DateTime<Utc>)> = self
            .cameras
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.source_url.clone(), c.activated_at))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (camera_id, source_url, activated_at) in entries {
            infos.push(CameraInfo {
                pipeline_running: self.pipeline.is_running(&camera_id).await,
                capture: self.distributor.stats(&camera_id).await.ok(),
                camera_id,
                source_url,
                activated_at,
            });
        }
        infos.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        infos
    }

    pub async fn active_count(&self) -> usize {
        self.cameras.read().await.len()
    }

    /// Deactivate every camera
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        for camera_id in &ids {
            self.deactivate(camera_id).await;
        }
        tracing::info!(count = ids.len(), "All cameras deactivated");
    }

    async fn broadcast_status(&self, camera_id: &str, active: bool, source: Option<&str>) {
        self.hub
            .broadcast(HubMessage::CameraStatus(CameraStatusMessage {
                camera_id: camera_id.to_string(),
                active,
                source: source.map(str::to_string),
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigStore;
    use crate::event_store::InMemoryEventStore;
    use crate::pipeline::testing::FakeObject;
    use crate::pipeline::Detectors;
    use crate::stream_publisher::{BinarySocketPublisher, ClientMode, MultipartPublisher};

    struct Harness {
        distributor: Arc<FrameDistributor>,
        pipeline: Arc<DetectionPipelineManager>,
        multipart: Arc<MultipartPublisher>,
        binary: Arc<BinarySocketPublisher>,
        hub: Arc<RealtimeHub>,
        manager: CameraManager,
    }

    fn harness() -> Harness {
        let distributor = Arc::new(FrameDistributor::new());
        let motion = Arc::new(MotionTracker::new());
        let hub = Arc::new(RealtimeHub::new());
        let pipeline = Arc::new(DetectionPipelineManager::new(
            distributor.clone(),
            Arc::new(ConfigStore::default()),
            motion.clone(),
            Detectors::new(FakeObject::returning(vec![])),
            Arc::new(InMemoryEventStore::new(10)),
            hub.clone(),
        ));
        let multipart = Arc::new(MultipartPublisher::new(distributor.clone(), 4));
        let binary = Arc::new(BinarySocketPublisher::new(distributor.clone(), 4));
        let publishers: Vec<Arc<dyn StreamPublisher>> = vec![
            multipart.clone() as Arc<dyn StreamPublisher>,
            binary.clone() as Arc<dyn StreamPublisher>,
        ];
        let manager = CameraManager::new(distributor.clone(), pipeline.clone(), publishers, motion, hub.clone());
        Harness {
            distributor,
            pipeline,
            multipart,
            binary,
            hub,
            manager,
        }
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let h = harness();
        assert!(h.manager.activate("cam1", None).await.unwrap());
        assert!(!h.manager.activate("cam1", None).await.unwrap());

        assert!(h.distributor.is_registered("cam1").await);
        assert!(h.pipeline.is_running("cam1").await);
        let stats = h.distributor.stats("cam1").await.unwrap();
        assert_eq!(stats.subscriber_count, 3);
        assert_eq!(h.manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_closes_everything() {
        let h = harness();
        h.manager.activate("cam1", None).await.unwrap();
        let mut mjpeg = h.multipart.connect("cam1").await.unwrap();
        let mut socket = h.binary.connect("cam1", ClientMode::Auto).await.unwrap();

        assert!(h.manager.deactivate("cam1").await);
        assert!(!h.manager.deactivate("cam1").await);

        assert!(!h.distributor.is_registered("cam1").await);
        assert!(!h.pipeline.is_running("cam1").await);
        assert!(mjpeg.next_part().await.is_none());
        assert!(socket.next_message().await.is_none());
        assert!(h.manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_reactivate_after_deactivate() {
        let h = harness();
        h.manager.activate("cam1", None).await.unwrap();
        h.manager.deactivate("cam1").await;
        assert!(h.manager.activate("cam1", None).await.unwrap());
        assert!(h.pipeline.is_running("cam1").await);
    }

    #[tokio::test]
    async fn test_status_broadcast() {
        let h = harness();
        let (_id, mut rx) = h.hub.register().await;

        h.manager.activate("cam1", None).await.unwrap();
        h.manager.deactivate("cam1").await;

        let first: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "camera_status");
        assert_eq!(first["data"]["active"], true);
        assert_eq!(second["data"]["active"], false);
    }

    #[tokio::test]
    async fn test_rejects_empty_id_and_unsupported_source() {
        let h = harness();
        assert!(matches!(h.manager.activate(" ", None).await, Err(Error::InvalidConfig(_))));
        assert!(matches!(
            h.manager.activate("cam1", Some("http://cam/snapshot.jpg")).await,
            Err(Error::InvalidConfig(_))
        ));
        assert!(!h.manager.is_active("cam1").await);
    }
}
