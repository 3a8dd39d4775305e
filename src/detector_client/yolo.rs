//! YOLO object detection client
//!
//! Multi-task analysis over `DetectionService/AnalyzeStream` plus the unary
//! `Configure` and `HealthCheck` calls.

use super::proto::{self, detection as pb};
use super::rpc::{InboundStream, RpcSettings, RpcStats, StreamTransport, StreamingRpc};
use super::threat::{threat_level, ThreatCategorization};
use super::types::{
    AnalyzeParams, Classification, Detection, DetectionResult, HealthStatus, Keypoint,
    OrientedDetection, PerTaskResults, PoseEstimate, YoloTask,
};
use super::{connect_lazy, request_stream, ObjectDetector};
use crate::config_store::YoloRuntimeConfig;
use crate::error::{Error, Result};
use crate::frame_distributor::Frame;
use crate::models::BoundingBox;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tonic::transport::Channel;

const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport for the object detection service
#[async_trait]
pub trait YoloTransport:
    StreamTransport<Request = pb::AnalyzeRequest, Response = pb::AnalyzeResponse>
{
    async fn configure(&self, request: pb::ConfigureRequest) -> Result<pb::ConfigureResponse>;
}

/// gRPC transport to `detection.v1.DetectionService`
#[derive(Clone)]
pub struct GrpcYoloTransport {
    channel: Channel,
}

impl GrpcYoloTransport {
    /// Lazily connected channel; nothing is dialed until the first call
    pub fn connect_lazy(endpoint: &str) -> Result<Self> {
        Ok(Self {
            channel: connect_lazy(endpoint)?,
        })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    fn client(&self) -> pb::DetectionServiceClient {
        pb::DetectionServiceClient::new(self.channel.clone())
    }
}

#[async_trait]
impl StreamTransport for GrpcYoloTransport {
    type Request = pb::AnalyzeRequest;
    type Response = pb::AnalyzeResponse;

    async fn open_stream(
        &self,
        outbound: mpsc::Receiver<pb::AnalyzeRequest>,
    ) -> Result<InboundStream<pb::AnalyzeResponse>> {
        proto::ready(&self.channel).await?;
        let mut client = self.client();

        // The call itself runs inside the returned stream so requests can
        // flow before the server sends response headers
        let call = async move {
            match client.analyze_stream(request_stream(outbound)).await {
                Ok(response) => response
                    .into_inner()
                    .map(|item| item.map_err(Error::from))
                    .boxed(),
                Err(status) => futures::stream::once(async move { Err(Error::from(status)) }).boxed(),
            }
        };
        Ok(futures::stream::once(call).flatten().boxed())
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let mut client = self.client();
        let response = client.health_check(pb::HealthRequest {}).await?.into_inner();
        Ok(HealthStatus {
            status: response.status,
            model_loaded: response.model_loaded,
            device: response.device,
            checked_at: Utc::now(),
            error: None,
        })
    }
}

#[async_trait]
impl YoloTransport for GrpcYoloTransport {
    async fn configure(&self, request: pb::ConfigureRequest) -> Result<pb::ConfigureResponse> {
        let mut client = self.client();
        Ok(client.configure(request).await?.into_inner())
    }
}

impl From<YoloTask> for pb::YoloTask {
    fn from(task: YoloTask) -> Self {
        match task {
            YoloTask::Detect => pb::YoloTask::Detect,
            YoloTask::Pose => pb::YoloTask::Pose,
            YoloTask::Segment => pb::YoloTask::Segment,
            YoloTask::Obb => pb::YoloTask::Obb,
            YoloTask::Classify => pb::YoloTask::Classify,
        }
    }
}

fn bbox(b: &pb::BBox) -> BoundingBox {
    BoundingBox::new(b.x1, b.y1, b.x2, b.y2)
}

/// Bounding box of a segmentation polygon
fn polygon_bbox(points: &[pb::Point]) -> Option<BoundingBox> {
    let first = points.first()?;
    let init = BoundingBox::new(first.x, first.y, first.x, first.y);
    Some(points.iter().fold(init, |acc, p| {
        BoundingBox::new(acc.x1.min(p.x), acc.y1.min(p.y), acc.x2.max(p.x), acc.y2.max(p.y))
    }))
}

/// Axis-aligned box enclosing a rotated box
fn oriented_bbox(o: &pb::OrientedBox) -> BoundingBox {
    let (sin, cos) = o.rotation.sin_cos();
    let half_w = (o.width * cos.abs() + o.height * sin.abs()) / 2.0;
    let half_h = (o.width * sin.abs() + o.height * cos.abs()) / 2.0;
    BoundingBox::new(
        o.x_center - half_w,
        o.y_center - half_h,
        o.x_center + half_w,
        o.y_center + half_h,
    )
}

fn track(id: i32) -> Option<i32> {
    (id != 0).then_some(id)
}

fn detection(
    class_name: String,
    class_id: i32,
    confidence: f32,
    bbox: BoundingBox,
    track_id: Option<i32>,
    source: YoloTask,
) -> Detection {
    let threat = threat_level(&class_name);
    Detection {
        class_name,
        class_id,
        confidence,
        bbox,
        track_id,
        source,
        threat,
    }
}

/// Split a multi-task response into per-task results and one merged list
///
/// Merge order is detect, segment, pose, obb. Pose estimates become `person`
/// detections from their keypoint boxes; segments use their mask boxes.
pub fn merge_response(
    response: &pb::AnalyzeResponse,
    params: &AnalyzeParams,
) -> (PerTaskResults, Vec<Detection>) {
    let mut per_task = PerTaskResults::default();

    if let Some(detect) = &response.detect {
        per_task.detect = detect
            .detections
            .iter()
            .filter_map(|d| {
                d.bbox.as_ref().map(|b| {
                    detection(d.class_name.clone(), d.class_id, d.confidence, bbox(b), track(d.track_id), YoloTask::Detect)
                })
            })
            .collect();
    }

    if let Some(segment) = &response.segment {
        per_task.segment = segment
            .segments
            .iter()
            .filter_map(|s| {
                let mask_box = s.bbox.as_ref().map(bbox).or_else(|| polygon_bbox(&s.polygon))?;
                Some(detection(s.class_name.clone(), s.class_id, s.confidence, mask_box, None, YoloTask::Segment))
            })
            .collect();
    }

    if let Some(pose) = &response.pose {
        per_task.pose = pose
            .poses
            .iter()
            .filter_map(|p| {
                let keypoints: Vec<Keypoint> = p
                    .keypoints
                    .iter()
                    .map(|k| Keypoint {
                        x: k.x,
                        y: k.y,
                        confidence: k.confidence,
                    })
                    .collect();
                let pose_box = p.bbox.as_ref().map(bbox).or_else(|| {
                    let points: Vec<pb::Point> = p
                        .keypoints
                        .iter()
                        .filter(|k| k.confidence > 0.0)
                        .map(|k| pb::Point { x: k.x, y: k.y })
                        .collect();
                    polygon_bbox(&points)
                })?;
                Some(PoseEstimate {
                    bbox: pose_box,
                    confidence: p.confidence,
                    keypoints,
                    track_id: track(p.track_id),
                })
            })
            .collect();
    }

    if let Some(obb) = &response.obb {
        per_task.obb = obb
            .boxes
            .iter()
            .map(|o| OrientedDetection {
                class_name: o.class_name.clone(),
                confidence: o.confidence,
                center: (o.x_center, o.y_center),
                size: (o.width, o.height),
                rotation: o.rotation,
            })
            .collect();
    }

    if let Some(classify) = &response.classify {
        per_task.classify = classify
            .top
            .iter()
            .map(|c| Classification {
                class_name: c.class_name.clone(),
                class_id: c.class_id,
                confidence: c.confidence,
            })
            .collect();
    }

    let mut merged: Vec<Detection> = Vec::new();
    merged.extend(per_task.detect.iter().cloned());
    merged.extend(per_task.segment.iter().cloned());
    merged.extend(per_task.pose.iter().map(|estimate| {
        detection(
            "person".to_string(),
            0,
            estimate.confidence,
            estimate.bbox,
            estimate.track_id,
            YoloTask::Pose,
        )
    }));
    if let Some(obb) = &response.obb {
        merged.extend(obb.boxes.iter().map(|o| {
            detection(o.class_name.clone(), o.class_id, o.confidence, oriented_bbox(o), None, YoloTask::Obb)
        }));
    }

    merged.retain(|d| {
        d.confidence >= params.confidence_threshold
            && (params.class_filter.is_empty() || params.class_filter.contains(&d.class_name))
    });

    (per_task, merged)
}

/// YOLO client
pub struct YoloClient<T: YoloTransport = GrpcYoloTransport> {
    rpc: StreamingRpc<T>,
    /// Tasks used when a call does not name any
    default_tasks: RwLock<Vec<YoloTask>>,
}

impl YoloClient<GrpcYoloTransport> {
    pub fn connect_lazy(endpoint: &str, tasks: Vec<YoloTask>, settings: RpcSettings) -> Result<Self> {
        Ok(Self::new(GrpcYoloTransport::connect_lazy(endpoint)?, tasks, settings))
    }
}

impl<T: YoloTransport> YoloClient<T> {
    pub fn new(transport: T, tasks: Vec<YoloTask>, settings: RpcSettings) -> Self {
        let tasks = if tasks.is_empty() {
            vec![YoloTask::Detect]
        } else {
            tasks
        };
        Self {
            rpc: StreamingRpc::new("yolo", transport, settings),
            default_tasks: RwLock::new(tasks),
        }
    }

    pub async fn tasks(&self) -> Vec<YoloTask> {
        self.default_tasks.read().await.clone()
    }

    pub async fn set_tasks(&self, tasks: Vec<YoloTask>) {
        if !tasks.is_empty() {
            *self.default_tasks.write().await = tasks;
        }
    }

    /// Run multi-task analysis on one frame
    pub async fn analyze(&self, frame: &Frame, params: &AnalyzeParams) -> Result<DetectionResult> {
        let tasks = if params.tasks.is_empty() {
            self.tasks().await
        } else {
            params.tasks.clone()
        };

        let request = pb::AnalyzeRequest {
            camera_id: frame.camera_id.clone(),
            frame_seq: frame.sequence,
            timestamp_ns: frame.captured_at.timestamp_nanos_opt().unwrap_or_default(),
            jpeg_data: frame.jpeg.clone(),
            tasks: tasks.iter().map(|t| pb::YoloTask::from(*t) as i32).collect(),
            conf_threshold: params.confidence_threshold,
            return_annotated: params.return_annotated,
            classes: params.class_filter.clone(),
        };

        let camera_id = frame.camera_id.clone();
        let sequence = frame.sequence;
        let response = self
            .rpc
            .call(request, params.timeout, move |r: &pb::AnalyzeResponse| {
                r.frame_seq == sequence && r.camera_id == camera_id
            })
            .await?;

        let (per_task, detections) = merge_response(&response, params);
        let threat = ThreatCategorization::from_detections(&detections);

        tracing::debug!(
            camera_id = %frame.camera_id,
            sequence = frame.sequence,
            detections = detections.len(),
            inference_ms = response.total_inference_ms,
            "YOLO analysis complete"
        );

        Ok(DetectionResult {
            camera_id: frame.camera_id.clone(),
            sequence: frame.sequence,
            per_task,
            detections,
            threat,
            annotated_jpeg: (!response.annotated_jpeg.is_empty()).then(|| response.annotated_jpeg.clone()),
            inference_time_ms: response.total_inference_ms,
            device: response.device,
        })
    }

    /// Push runtime parameters to the service, out of band from the stream
    pub async fn configure(&self, config: &YoloRuntimeConfig) -> Result<YoloRuntimeConfig> {
        let request = pb::ConfigureRequest {
            conf_threshold: Some(config.confidence_threshold),
            enable_tracking: Some(config.enable_tracking),
            tracker_type: Some(config.tracker_type.clone()),
            classes: config.class_filter.clone(),
        };

        let response = tokio::time::timeout(
            CONFIGURE_TIMEOUT,
            self.rpc.transport().configure(request),
        )
        .await
        .map_err(|_| Error::Timeout("yolo configure timed out".to_string()))??;

        if !response.success {
            return Err(Error::ServiceUnavailable(format!(
                "yolo configure rejected: {}",
                response.message
            )));
        }

        tracing::info!(
            confidence_threshold = response.conf_threshold,
            tracking_enabled = response.tracking_enabled,
            tracker_type = %response.tracker_type,
            classes = ?response.classes,
            "YOLO configuration updated"
        );

        Ok(YoloRuntimeConfig {
            confidence_threshold: response.conf_threshold,
            class_filter: response.classes,
            enable_tracking: response.tracking_enabled,
            tracker_type: response.tracker_type,
        })
    }

    pub async fn health(&self) -> HealthStatus {
        self.rpc.health().await
    }

    pub async fn stats(&self) -> RpcStats {
        self.rpc.stats().await
    }

    pub async fn reset(&self) {
        self.rpc.reset().await
    }
}

#[async_trait]
impl<T: YoloTransport> ObjectDetector for YoloClient<T> {
    async fn detect(&self, frame: &Frame, params: &AnalyzeParams) -> Result<DetectionResult> {
        self.analyze(frame, params).await
    }

    async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector_client::threat::ThreatLevel;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn pb_box(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<pb::BBox> {
        Some(pb::BBox { x1, y1, x2, y2 })
    }

    fn det(class: &str, confidence: f32) -> pb::Detection {
        pb::Detection {
            class_id: 0,
            class_name: class.to_string(),
            confidence,
            bbox: pb_box(0.0, 0.0, 10.0, 10.0),
            track_id: 0,
        }
    }

    #[test]
    fn test_merge_order_and_synthesized_persons() {
        let response = pb::AnalyzeResponse {
            detect: Some(pb::DetectResult {
                detections: vec![det("car", 0.9)],
                inference_ms: 3.0,
            }),
            segment: Some(pb::SegmentResult {
                segments: vec![pb::Segment {
                    class_id: 16,
                    class_name: "dog".to_string(),
                    confidence: 0.7,
                    bbox: None,
                    polygon: vec![
                        pb::Point { x: 5.0, y: 8.0 },
                        pb::Point { x: 15.0, y: 2.0 },
                        pb::Point { x: 9.0, y: 20.0 },
                    ],
                }],
                inference_ms: 4.0,
            }),
            pose: Some(pb::PoseResult {
                poses: vec![pb::Pose {
                    bbox: pb_box(1.0, 2.0, 3.0, 4.0),
                    confidence: 0.8,
                    keypoints: vec![],
                    track_id: 7,
                }],
                inference_ms: 5.0,
            }),
            ..Default::default()
        };

        let (per_task, merged) = merge_response(&response, &AnalyzeParams::default());
        assert_eq!(per_task.detect.len(), 1);
        assert_eq!(per_task.pose.len(), 1);

        let classes: Vec<&str> = merged.iter().map(|d| d.class_name.as_str()).collect();
        assert_eq!(classes, vec!["car", "dog", "person"]);

        assert_eq!(merged[1].bbox, BoundingBox::new(5.0, 2.0, 15.0, 20.0));
        assert_eq!(merged[2].source, YoloTask::Pose);
        assert_eq!(merged[2].track_id, Some(7));
        assert_eq!(merged[2].threat, ThreatLevel::High);
    }

    #[test]
    fn test_obb_becomes_enclosing_box() {
        let response = pb::AnalyzeResponse {
            obb: Some(pb::ObbResult {
                boxes: vec![pb::OrientedBox {
                    class_id: 1,
                    class_name: "truck".to_string(),
                    confidence: 0.9,
                    x_center: 50.0,
                    y_center: 50.0,
                    width: 20.0,
                    height: 10.0,
                    rotation: std::f32::consts::FRAC_PI_2,
                }],
                inference_ms: 1.0,
            }),
            ..Default::default()
        };
        let (_, merged) = merge_response(&response, &AnalyzeParams::default());
        let b = merged[0].bbox;
        assert!((b.width() - 10.0).abs() < 1e-3);
        assert!((b.height() - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_and_class_filter() {
        let response = pb::AnalyzeResponse {
            detect: Some(pb::DetectResult {
                detections: vec![det("person", 0.8), det("car", 0.3), det("dog", 0.9)],
                inference_ms: 1.0,
            }),
            ..Default::default()
        };
        let params = AnalyzeParams {
            confidence_threshold: 0.5,
            class_filter: vec!["person".to_string(), "car".to_string()],
            ..Default::default()
        };
        let (_, merged) = merge_response(&response, &params);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].class_name, "person");
    }

    /// Scripted YOLO service replying with fixed detections
    #[derive(Clone, Default)]
    struct ScriptedYolo {
        configured: Arc<Mutex<Option<pb::ConfigureRequest>>>,
    }

    #[async_trait]
    impl StreamTransport for ScriptedYolo {
        type Request = pb::AnalyzeRequest;
        type Response = pb::AnalyzeResponse;

        async fn open_stream(
            &self,
            outbound: mpsc::Receiver<pb::AnalyzeRequest>,
        ) -> Result<InboundStream<pb::AnalyzeResponse>> {
            Ok(request_stream(outbound)
                .map(|req| {
                    Ok(pb::AnalyzeResponse {
                        camera_id: req.camera_id,
                        frame_seq: req.frame_seq,
                        detect: Some(pb::DetectResult {
                            detections: vec![det("person", 0.8), det("car", 0.6)],
                            inference_ms: 12.0,
                        }),
                        total_inference_ms: 12.0,
                        device: "cuda:0".to_string(),
                        ..Default::default()
                    })
                })
                .boxed())
        }

        async fn health_check(&self) -> Result<HealthStatus> {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                model_loaded: true,
                device: "cuda:0".to_string(),
                checked_at: Utc::now(),
                error: None,
            })
        }
    }

    #[async_trait]
    impl YoloTransport for ScriptedYolo {
        async fn configure(&self, request: pb::ConfigureRequest) -> Result<pb::ConfigureResponse> {
            *self.configured.lock().await = Some(request.clone());
            Ok(pb::ConfigureResponse {
                success: true,
                message: String::new(),
                conf_threshold: request.conf_threshold.unwrap_or_default(),
                tracking_enabled: request.enable_tracking.unwrap_or_default(),
                tracker_type: request.tracker_type.unwrap_or_default(),
                classes: request.classes,
            })
        }
    }

    #[tokio::test]
    async fn test_analyze_categorizes_threats() {
        let client = YoloClient::new(ScriptedYolo::default(), vec![YoloTask::Detect], RpcSettings::default());
        let frame = Frame::new("cam1", 42, Bytes::from_static(b"jpeg"));

        let result = client.analyze(&frame, &AnalyzeParams::default()).await.unwrap();
        assert_eq!(result.sequence, 42);
        assert_eq!(result.threat.high, vec!["person".to_string()]);
        assert_eq!(result.threat.medium, vec!["car".to_string()]);
        assert!(result.threat.low.is_empty());
        assert!(result.annotated_jpeg.is_none());
        assert_eq!(result.device, "cuda:0");
        assert!(result.has_person_above(0.5));
    }

    #[tokio::test]
    async fn test_configure_pushes_parameters() {
        let transport = ScriptedYolo::default();
        let client = YoloClient::new(transport.clone(), vec![], RpcSettings::default());

        let applied = client
            .configure(&YoloRuntimeConfig {
                confidence_threshold: 0.7,
                class_filter: vec!["person".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(applied.confidence_threshold, 0.7);
        let sent = transport.configured.lock().await.clone().unwrap();
        assert_eq!(sent.conf_threshold, Some(0.7));
        assert_eq!(sent.classes, vec!["person".to_string()]);
    }
}
