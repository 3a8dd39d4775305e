//! DetectionPipeline - Per-camera Detection Orchestration
//!
//! ## Responsibilities
//!
//! - One processing loop per active camera, fed by a distributor subscription
//! - Mode gating per frame (`gate`)
//! - Sequential detector chaining YOLO → Face → Plate (`chain`)
//! - Overlay drawing, annotated-frame publication, event recording
//!
//! ## Design Principles
//!
//! - Frames are processed strictly in sequence order per camera, so annotated
//!   output is ordered without any reordering downstream
//! - A detector failure aborts that frame only; the loop keeps going
//! - Config is read as one immutable snapshot per frame

pub mod chain;
pub mod gate;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{run_chain, ChainOutput, Detectors};
pub use gate::{should_run, CameraGate, GateInputs};

use crate::config_store::{ConfigStore, DetectionMode, EffectiveConfig};
use crate::error::{Error, Result};
use crate::event_store::{Event, EventStore};
use crate::frame_distributor::{Frame, FrameDistributor, Subscription, DEFAULT_QUEUE_DEPTH};
use crate::motion_signal::MotionSignal;
use crate::overlay::{OverlayContent, OverlayRenderer};
use crate::realtime_hub::{DetectionMessage, HubMessage, RealtimeHub};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Annotated output for one processed frame
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub camera_id: String,
    /// Sequence of the source frame
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub jpeg: Bytes,
    pub detection_count: usize,
}

/// Receiver of annotated frames (stream publishers)
#[async_trait]
pub trait AnnotatedFrameSink: Send + Sync {
    async fn publish_annotated(&self, frame: Arc<AnnotatedFrame>);
}

/// Pipeline statistics for a camera
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub camera_id: String,
    pub mode: Option<DetectionMode>,
    pub frames_seen: u64,
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
    pub events_recorded: u64,
    pub last_inference_ms: Option<f32>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct LastRun {
    mode: Option<DetectionMode>,
    inference_ms: Option<f32>,
    at: Option<DateTime<Utc>>,
    error: Option<String>,
}

#[derive(Default)]
struct PipelineCounters {
    frames_seen: AtomicU64,
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    events: AtomicU64,
    last: RwLock<LastRun>,
}

impl PipelineCounters {
    async fn snapshot(&self, camera_id: &str) -> PipelineStats {
        let last = self.last.read().await;
        PipelineStats {
            camera_id: camera_id.to_string(),
            mode: last.mode,
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            events_recorded: self.events.load(Ordering::Relaxed),
            last_inference_ms: last.inference_ms,
            last_run_at: last.at,
            last_error: last.error.clone(),
        }
    }
}

/// Shared collaborators of every camera loop
struct PipelineContext {
    config_store: Arc<ConfigStore>,
    motion: Arc<dyn MotionSignal>,
    detectors: Detectors,
    overlay: Arc<OverlayRenderer>,
    events: Arc<dyn EventStore>,
    hub: Arc<RealtimeHub>,
    sinks: RwLock<Vec<Arc<dyn AnnotatedFrameSink>>>,
}

/// Per-camera loop state
struct LoopState {
    gate: CameraGate,
    mode: Option<DetectionMode>,
}

impl PipelineContext {
    async fn process_frame(&self, frame: &Frame, state: &mut LoopState, counters: &PipelineCounters) {
        counters.frames_seen.fetch_add(1, Ordering::Relaxed);

        let config = self.config_store.snapshot(&frame.camera_id).await;
        if state.mode != Some(config.mode) {
            tracing::info!(
                camera_id = %frame.camera_id,
                mode = %config.mode.as_str(),
                "Detection mode in effect"
            );
            state.gate.reset();
            state.mode = Some(config.mode);
            counters.last.write().await.mode = Some(config.mode);
        }

        let motion_active = if gate::uses_motion(config.mode) {
            self.motion.is_motion_active(&frame.camera_id).await
        } else {
            false
        };

        if !state.gate.decide(&config, motion_active, Instant::now()) {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(camera_id = %frame.camera_id, sequence = frame.sequence, "Detection gated off");
            return;
        }
        counters.runs.fetch_add(1, Ordering::Relaxed);

        let output = match run_chain(&self.detectors, frame, &config).await {
            Ok(output) => output,
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                counters.last.write().await.error = Some(e.to_string());
                tracing::warn!(
                    camera_id = %frame.camera_id,
                    sequence = frame.sequence,
                    error = %e,
                    "Detection failed for frame"
                );
                return;
            }
        };

        {
            let mut last = counters.last.write().await;
            last.inference_ms = Some(output.total_inference_ms());
            last.at = Some(Utc::now());
            last.error = None;
        }

        tracing::debug!(
            camera_id = %frame.camera_id,
            sequence = frame.sequence,
            detections = output.detection.detections.len(),
            faces = output.face_count(),
            invoked = ?output.invoked,
            "Detection chain complete"
        );

        let annotated = Arc::new(AnnotatedFrame {
            camera_id: frame.camera_id.clone(),
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            jpeg: self.annotate(frame, &output, &config).await,
            detection_count: output.detection.detections.len(),
        });
        for sink in self.sinks.read().await.iter() {
            sink.publish_annotated(annotated.clone()).await;
        }

        if !config.mode.publishes_events() || !output.has_findings() {
            return;
        }

        let faces = output.faces.as_ref().map(|f| f.faces.clone()).unwrap_or_default();
        let categorization = output.detection.threat.clone();
        let event = Event {
            event_id: 0,
            camera_id: frame.camera_id.clone(),
            sequence: frame.sequence,
            captured_at: frame.captured_at,
            mode: config.mode,
            primary_event: Event::primary_class(&categorization, !faces.is_empty()),
            threat: categorization.highest(),
            categorization,
            detections: output.detection.detections.clone(),
            faces,
            plates: output.plates.clone(),
            inference_ms: output.total_inference_ms(),
            created_at: Utc::now(),
        };
        let message = DetectionMessage {
            event_id: None,
            camera_id: event.camera_id.clone(),
            sequence: event.sequence,
            primary_event: event.primary_event.clone(),
            threat: event.threat.map(|t| t.as_str().to_string()),
            detection_count: event.detections.len(),
            face_count: event.faces.len(),
            known_faces: event.known_faces(),
            inference_ms: event.inference_ms,
            timestamp: event.captured_at.to_rfc3339(),
        };

        let event_id = self.events.record(event).await;
        counters.events.fetch_add(1, Ordering::Relaxed);
        self.hub
            .broadcast(HubMessage::Detection(DetectionMessage {
                event_id: Some(event_id),
                ..message
            }))
            .await;
    }

    /// Draw the overlay off the async runtime. Falls back to the raw bytes.
    async fn annotate(&self, frame: &Frame, output: &ChainOutput, config: &EffectiveConfig) -> Bytes {
        let detections = output.detection.detections.clone();
        let poses = output.detection.per_task.pose.clone();
        let faces = output.faces.as_ref().map(|f| f.faces.clone()).unwrap_or_default();
        if detections.is_empty() && poses.is_empty() && faces.is_empty() {
            return frame.jpeg.clone();
        }

        let overlay = self.overlay.clone();
        let jpeg = frame.jpeg.clone();
        let style = config.overlay.clone();
        let rendered = tokio::task::spawn_blocking(move || {
            overlay.render(
                &jpeg,
                OverlayContent {
                    detections: &detections,
                    faces: &faces,
                    poses: &poses,
                },
                &style,
            )
        })
        .await;

        match rendered {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                tracing::warn!(camera_id = %frame.camera_id, sequence = frame.sequence, error = %e, "Overlay failed");
                frame.jpeg.clone()
            }
            Err(e) => {
                tracing::error!(camera_id = %frame.camera_id, error = %e, "Overlay task panicked");
                frame.jpeg.clone()
            }
        }
    }
}

struct CameraPipeline {
    counters: Arc<PipelineCounters>,
    task: JoinHandle<()>,
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// DetectionPipelineManager instance
pub struct DetectionPipelineManager {
    distributor: Arc<FrameDistributor>,
    ctx: Arc<PipelineContext>,
    pipelines: RwLock<HashMap<String, CameraPipeline>>,
    queue_depth: usize,
}

impl DetectionPipelineManager {
    /// Create new DetectionPipelineManager
    pub fn new(
        distributor: Arc<FrameDistributor>,
        config_store: Arc<ConfigStore>,
        motion: Arc<dyn MotionSignal>,
        detectors: Detectors,
        events: Arc<dyn EventStore>,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Self {
            distributor,
            ctx: Arc::new(PipelineContext {
                config_store,
                motion,
                detectors,
                overlay: Arc::new(OverlayRenderer::new()),
                events,
                hub,
                sinks: RwLock::new(Vec::new()),
            }),
            pipelines: RwLock::new(HashMap::new()),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    pub fn with_overlay(mut self, overlay: Arc<OverlayRenderer>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.overlay = overlay;
        }
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Register a receiver of annotated frames
    pub async fn add_sink(&self, sink: Arc<dyn AnnotatedFrameSink>) {
        self.ctx.sinks.write().await.push(sink);
    }

    /// Start the processing loop for a camera. Returns false if already running.
    pub async fn start(&self, camera_id: &str) -> Result<bool> {
        let mut pipelines = self.pipelines.write().await;
        if let Some(existing) = pipelines.get(camera_id) {
            if !existing.task.is_finished() {
                return Ok(false);
            }
        }

        let subscription = self.distributor.subscribe(camera_id, self.queue_depth).await?;
        let counters = Arc::new(PipelineCounters::default());
        let task = tokio::spawn(run_loop(self.ctx.clone(), counters.clone(), subscription));

        pipelines.insert(camera_id.to_string(), CameraPipeline { counters, task });
        tracing::info!(camera_id = %camera_id, queue_depth = self.queue_depth, "Detection pipeline started");
        Ok(true)
    }

    /// Stop a camera's loop. Calling it twice is a no-op.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let removed = self.pipelines.write().await.remove(camera_id);
        match removed {
            Some(pipeline) => {
                pipeline.task.abort();
                tracing::info!(camera_id = %camera_id, "Detection pipeline stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, camera_id: &str) -> bool {
        self.pipelines
            .read()
            .await
            .get(camera_id)
            .map(|p| !p.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn active_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pipeline statistics for a camera
    pub async fn stats(&self, camera_id: &str) -> Result<PipelineStats> {
        let counters = self
            .pipelines
            .read()
            .await
            .get(camera_id)
            .map(|p| p.counters.clone())
            .ok_or_else(|| Error::NotFound(format!("pipeline for camera {}", camera_id)))?;
        Ok(counters.snapshot(camera_id).await)
    }

    /// Stop every loop
    pub async fn shutdown(&self) {
        let mut pipelines = self.pipelines.write().await;
        let count = pipelines.len();
        pipelines.clear();
        tracing::info!(count, "All detection pipelines stopped");
    }
}

async fn run_loop(ctx: Arc<PipelineContext>, counters: Arc<PipelineCounters>, mut subscription: Subscription) {
    let camera_id = subscription.camera_id().to_string();
    let mut state = LoopState {
        gate: CameraGate::new(),
        mode: None,
    };

    tracing::debug!(camera_id = %camera_id, "Pipeline loop running");
    while let Some(frame) = subscription.recv().await {
        ctx.process_frame(&frame, &mut state, &counters).await;
    }
    tracing::info!(camera_id = %camera_id, "Pipeline loop ended, subscription closed");
}

#[cfg(test)]
mod tests {
    use super::testing::{black_jpeg, FakeFace, FakeObject, RecordingSink};
    use super::*;
    use crate::config_store::{CameraDetectionConfig, DetectorKind};
    use crate::event_store::InMemoryEventStore;
    use crate::motion_signal::MotionTracker;
    use std::time::Duration;

    struct Harness {
        distributor: Arc<FrameDistributor>,
        config_store: Arc<ConfigStore>,
        events: Arc<InMemoryEventStore>,
        sink: Arc<RecordingSink>,
        manager: DetectionPipelineManager,
    }

    async fn harness(object: Arc<FakeObject>, face: Option<Arc<FakeFace>>, mode: DetectionMode) -> Harness {
        let distributor = Arc::new(FrameDistributor::new());
        distributor.register_camera("cam1").await;
        let config_store = Arc::new(ConfigStore::default());
        config_store
            .update_camera(
                "cam1",
                CameraDetectionConfig {
                    mode: Some(mode),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut detectors = Detectors::new(object);
        if let Some(face) = face {
            detectors = detectors.with_face(face);
        }
        let events = Arc::new(InMemoryEventStore::new(100));
        let manager = DetectionPipelineManager::new(
            distributor.clone(),
            config_store.clone(),
            Arc::new(MotionTracker::new()),
            detectors,
            events.clone(),
            Arc::new(RealtimeHub::new()),
        )
        .with_queue_depth(16);
        let sink = RecordingSink::new();
        manager.add_sink(sink.clone()).await;
        manager.start("cam1").await.unwrap();

        Harness {
            distributor,
            config_store,
            events,
            sink,
            manager,
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn publish(h: &Harness, sequences: &[u64]) {
        for seq in sequences {
            h.distributor
                .publish(Frame::new("cam1", *seq, black_jpeg()))
                .await;
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_next_frame() {
        let h = harness(FakeObject::failing_on(vec![2]), None, DetectionMode::Continuous).await;
        publish(&h, &[1, 2, 3]).await;

        wait_until(|| h.sink.sequences().len() == 2).await;
        assert_eq!(h.sink.sequences(), vec![1, 3]);

        let stats = h.manager.stats("cam1").await.unwrap();
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.is_none());
        assert_eq!(h.events.count().await, 2);
    }

    #[tokio::test]
    async fn test_face_runs_after_person() {
        let object = FakeObject::returning(vec![("person", 0.9)]);
        let face = FakeFace::observing(object.clone());
        let h = harness(object.clone(), Some(face.clone()), DetectionMode::Continuous).await;
        publish(&h, &[1, 2]).await;

        wait_until(|| h.sink.sequences().len() == 2).await;
        assert_eq!(face.object_calls_seen(), vec![1, 2]);

        let events = h.events.latest(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].faces.len(), 1);
        assert_eq!(events[0].primary_event, "person");
    }

    #[tokio::test]
    async fn test_visual_only_publishes_without_events() {
        let h = harness(
            FakeObject::returning(vec![("person", 0.9)]),
            None,
            DetectionMode::VisualOnly,
        )
        .await;
        publish(&h, &[1, 2]).await;

        wait_until(|| h.sink.sequences().len() == 2).await;
        assert_eq!(h.events.count().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_makes_no_calls() {
        let object = FakeObject::returning(vec![("person", 0.9)]);
        let h = harness(object.clone(), None, DetectionMode::Disabled).await;
        publish(&h, &[1, 2, 3]).await;

        let manager = &h.manager;
        for _ in 0..200 {
            if manager.stats("cam1").await.unwrap().skipped == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.stats("cam1").await.unwrap().skipped, 3);
        assert_eq!(object.calls(), 0);
        assert!(h.sink.sequences().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_found_publishes_frame_but_no_event() {
        let h = harness(FakeObject::returning(vec![]), None, DetectionMode::Continuous).await;
        publish(&h, &[1]).await;

        wait_until(|| h.sink.sequences().len() == 1).await;
        assert_eq!(h.events.count().await, 0);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let h = harness(FakeObject::returning(vec![]), None, DetectionMode::Continuous).await;
        assert!(!h.manager.start("cam1").await.unwrap());
        assert!(h.manager.stop("cam1").await);
        assert!(!h.manager.stop("cam1").await);
        assert!(matches!(h.manager.stats("cam1").await, Err(Error::NotFound(_))));

        let err = h.manager.start("unknown").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_loop_ends_when_camera_deactivated() {
        let h = harness(FakeObject::returning(vec![]), None, DetectionMode::Continuous).await;
        h.distributor.deactivate_camera("cam1").await;

        for _ in 0..200 {
            if !h.manager.is_running("cam1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.manager.is_running("cam1").await);
    }

    #[tokio::test]
    async fn test_config_change_applies_to_next_frame() {
        let object = FakeObject::returning(vec![("person", 0.9)]);
        let h = harness(object.clone(), None, DetectionMode::Continuous).await;
        publish(&h, &[1]).await;
        wait_until(|| h.sink.sequences().len() == 1).await;

        h.config_store
            .update_camera(
                "cam1",
                CameraDetectionConfig {
                    mode: Some(DetectionMode::Disabled),
                    detectors: Some(Vec::<DetectorKind>::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        publish(&h, &[2, 3]).await;

        for _ in 0..200 {
            if h.manager.stats("cam1").await.unwrap().frames_seen == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(object.calls(), 1);
        assert_eq!(h.sink.sequences(), vec![1]);
    }
}
