//! ConfigStore data types
//!
//! Global detection defaults, per-camera overrides and the merged
//! `EffectiveConfig` snapshot read by the pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Detection mode (per camera)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Never runs detection
    Disabled,
    /// Always runs, publishes annotated frames but no events/alerts
    VisualOnly,
    /// Always runs
    Continuous,
    /// Runs while motion is active plus a trailing cooldown
    #[default]
    MotionTriggered,
    /// Runs when the schedule interval has elapsed since the last run
    Scheduled,
    /// Scheduled OR motion triggered
    Hybrid,
}

impl DetectionMode {
    /// Whether completed detections are published as events
    pub fn publishes_events(&self) -> bool {
        !matches!(self, DetectionMode::VisualOnly | DetectionMode::Disabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Disabled => "disabled",
            DetectionMode::VisualOnly => "visual_only",
            DetectionMode::Continuous => "continuous",
            DetectionMode::MotionTriggered => "motion_triggered",
            DetectionMode::Scheduled => "scheduled",
            DetectionMode::Hybrid => "hybrid",
        }
    }
}

/// Detector execution mode. Only sequential chaining is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
}

/// Detector kinds, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Yolo,
    Face,
    /// Reserved; runs only after a vehicle detection
    Plate,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Yolo => "yolo",
            DetectorKind::Face => "face",
            DetectorKind::Plate => "plate",
        }
    }
}

/// Per-detector confidence thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    /// Object detection confidence
    pub yolo: f32,
    /// Face similarity threshold for identity matching
    pub face: f32,
    pub plate: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            yolo: 0.5,
            face: 0.5,
            plate: 0.5,
        }
    }
}

/// RGB color
pub type Rgb = [u8; 3];

/// Overlay drawing style
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayStyle {
    pub box_thickness: u32,
    pub person_color: Rgb,
    pub vehicle_color: Rgb,
    pub other_color: Rgb,
    pub face_color: Rgb,
    pub show_labels: bool,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            box_thickness: 2,
            person_color: [255, 0, 0],
            vehicle_color: [255, 165, 0],
            other_color: [0, 255, 0],
            face_color: [0, 255, 255],
            show_labels: true,
        }
    }
}

/// Global detection defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalDetectionConfig {
    pub mode: DetectionMode,
    pub execution_mode: ExecutionMode,
    pub detectors: Vec<DetectorKind>,
    pub schedule_interval_ms: u64,
    pub motion_sensitivity: f32,
    pub motion_cooldown_ms: u64,
    pub confidence: ConfidenceThresholds,
    /// Classes the object detector keeps; empty keeps all
    pub class_filter: Vec<String>,
    pub overlay: OverlayStyle,
}

impl Default for GlobalDetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::MotionTriggered,
            execution_mode: ExecutionMode::Sequential,
            detectors: vec![DetectorKind::Yolo, DetectorKind::Face],
            schedule_interval_ms: 5000,
            motion_sensitivity: 0.1,
            motion_cooldown_ms: 2000,
            confidence: ConfidenceThresholds::default(),
            class_filter: Vec::new(),
            overlay: OverlayStyle::default(),
        }
    }
}

/// Per-camera overrides; unset fields inherit the global value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraDetectionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DetectionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detectors: Option<Vec<DetectorKind>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_sensitivity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_cooldown_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yolo_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_filter: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayStyle>,
}

/// Merged per-camera configuration
///
/// Built once per update and shared as `Arc<EffectiveConfig>`; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub camera_id: String,
    pub mode: DetectionMode,
    pub execution_mode: ExecutionMode,
    pub detectors: Vec<DetectorKind>,
    pub schedule_interval_ms: u64,
    pub motion_sensitivity: f32,
    pub motion_cooldown_ms: u64,
    pub confidence: ConfidenceThresholds,
    pub class_filter: Vec<String>,
    pub overlay: OverlayStyle,
}

impl EffectiveConfig {
    /// Merge camera overrides onto the global defaults
    pub fn merge(
        camera_id: &str,
        global: &GlobalDetectionConfig,
        camera: Option<&CameraDetectionConfig>,
    ) -> Self {
        let mut config = Self {
            camera_id: camera_id.to_string(),
            mode: global.mode,
            execution_mode: global.execution_mode,
            detectors: global.detectors.clone(),
            schedule_interval_ms: global.schedule_interval_ms,
            motion_sensitivity: global.motion_sensitivity,
            motion_cooldown_ms: global.motion_cooldown_ms,
            confidence: global.confidence,
            class_filter: global.class_filter.clone(),
            overlay: global.overlay.clone(),
        };

        let Some(camera) = camera else {
            return config;
        };

        if let Some(mode) = camera.mode {
            config.mode = mode;
        }
        if let Some(detectors) = &camera.detectors {
            config.detectors = detectors.clone();
        }
        if let Some(v) = camera.schedule_interval_ms {
            config.schedule_interval_ms = v;
        }
        if let Some(v) = camera.motion_sensitivity {
            config.motion_sensitivity = v;
        }
        if let Some(v) = camera.motion_cooldown_ms {
            config.motion_cooldown_ms = v;
        }
        if let Some(v) = camera.yolo_confidence {
            config.confidence.yolo = v;
        }
        if let Some(v) = camera.face_similarity {
            config.confidence.face = v;
        }
        if let Some(filter) = &camera.class_filter {
            config.class_filter = filter.clone();
        }
        if let Some(overlay) = &camera.overlay {
            config.overlay = overlay.clone();
        }
        config
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn motion_cooldown(&self) -> Duration {
        Duration::from_millis(self.motion_cooldown_ms)
    }

    pub fn has_detector(&self, kind: DetectorKind) -> bool {
        self.detectors.contains(&kind)
    }
}

/// YOLO runtime parameters as last pushed via Configure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YoloRuntimeConfig {
    pub confidence_threshold: f32,
    #[serde(default)]
    pub class_filter: Vec<String>,
    #[serde(default)]
    pub enable_tracking: bool,
    #[serde(default = "default_tracker_type")]
    pub tracker_type: String,
}

fn default_tracker_type() -> String {
    "bytetrack".to_string()
}

impl Default for YoloRuntimeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            class_filter: Vec::new(),
            enable_tracking: false,
            tracker_type: default_tracker_type(),
        }
    }
}
