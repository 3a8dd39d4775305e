//! Detector result types
//!
//! Domain view of the detector responses. These are what the pipeline,
//! overlay and event store see; wire types stay in `proto`.

use super::threat::{ThreatCategorization, ThreatLevel};
use crate::models::BoundingBox;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Object detector task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YoloTask {
    Detect,
    Pose,
    Segment,
    Obb,
    Classify,
}

impl YoloTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            YoloTask::Detect => "detect",
            YoloTask::Pose => "pose",
            YoloTask::Segment => "segment",
            YoloTask::Obb => "obb",
            YoloTask::Classify => "classify",
        }
    }
}

impl FromStr for YoloTask {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detect" => Ok(YoloTask::Detect),
            "pose" => Ok(YoloTask::Pose),
            "segment" => Ok(YoloTask::Segment),
            "obb" => Ok(YoloTask::Obb),
            "classify" => Ok(YoloTask::Classify),
            other => Err(crate::Error::InvalidConfig(format!("unknown yolo task: {}", other))),
        }
    }
}

/// Parameters for one object-detection call
#[derive(Debug, Clone)]
pub struct AnalyzeParams {
    /// Empty uses the client's configured tasks
    pub tasks: Vec<YoloTask>,
    pub confidence_threshold: f32,
    /// Empty keeps all classes
    pub class_filter: Vec<String>,
    pub return_annotated: bool,
    /// Overrides the client's response timeout
    pub timeout: Option<Duration>,
}

impl Default for AnalyzeParams {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            confidence_threshold: 0.5,
            class_filter: Vec::new(),
            return_annotated: false,
            timeout: None,
        }
    }
}

/// One detected object after merging all tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub class_id: i32,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i32>,
    /// Task that produced the detection
    pub source: YoloTask,
    pub threat: ThreatLevel,
}

impl Detection {
    pub fn is_person(&self) -> bool {
        self.class_name == "person"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub keypoints: Vec<Keypoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientedDetection {
    pub class_name: String,
    pub confidence: f32,
    pub center: (f32, f32),
    pub size: (f32, f32),
    pub rotation: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class_name: String,
    pub class_id: i32,
    pub confidence: f32,
}

/// Raw per-task output as returned by the service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerTaskResults {
    pub detect: Vec<Detection>,
    pub pose: Vec<PoseEstimate>,
    pub segment: Vec<Detection>,
    pub obb: Vec<OrientedDetection>,
    pub classify: Vec<Classification>,
}

/// Object detector output for one frame
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub camera_id: String,
    pub sequence: u64,
    pub per_task: PerTaskResults,
    /// Merged detection list across detect / segment / pose / obb
    pub detections: Vec<Detection>,
    pub threat: ThreatCategorization,
    #[serde(skip)]
    pub annotated_jpeg: Option<Bytes>,
    pub inference_time_ms: f32,
    pub device: String,
}

impl DetectionResult {
    /// Person detections at or above the threshold
    pub fn persons_above(&self, threshold: f32) -> impl Iterator<Item = &Detection> {
        self.detections
            .iter()
            .filter(move |d| d.is_person() && d.confidence >= threshold)
    }

    pub fn has_person_above(&self, threshold: f32) -> bool {
        self.persons_above(threshold).next().is_some()
    }

    /// Vehicle detections at or above the threshold
    pub fn vehicles_above(&self, threshold: f32) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(move |d| {
            super::threat::is_vehicle(&d.class_name) && d.confidence >= threshold
        })
    }
}

/// One recognized face
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Known identity name, None for unknown faces
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub similarity: f32,
    pub is_known: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Person track the face was matched to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i32>,
}

/// Parameters for one face recognition call
#[derive(Debug, Clone)]
pub struct FaceParams {
    pub similarity_threshold: f32,
    pub return_annotated: bool,
    pub timeout: Option<Duration>,
}

impl Default for FaceParams {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            return_annotated: false,
            timeout: None,
        }
    }
}

/// Face detector output for one frame
#[derive(Debug, Clone, Serialize)]
pub struct FaceResult {
    pub faces: Vec<FaceMatch>,
    pub known_count: usize,
    pub unknown_count: usize,
    #[serde(skip)]
    pub annotated_jpeg: Option<Bytes>,
    pub inference_time_ms: f32,
    pub device: String,
}

/// One read license plate (reserved detector)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateRead {
    pub bbox: BoundingBox,
    pub text: String,
    pub confidence: f32,
}

/// Cached detector health
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" && self.model_loaded
    }

    /// Health record for a service that could not be reached
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            status: "unreachable".to_string(),
            model_loaded: false,
            device: String::new(),
            checked_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}
