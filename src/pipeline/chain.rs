//! Sequential detector chain
//!
//! Object detector first. Face recognition only after a person above the
//! YOLO threshold, plate reading only after a vehicle. Any detector error
//! aborts the chain for this frame.

use crate::config_store::{DetectorKind, EffectiveConfig};
use crate::detector_client::{
    AnalyzeParams, DetectionResult, FaceDetector, FaceParams, FaceResult, ObjectDetector,
    PlateRead, PlateReader,
};
use crate::error::{Error, Result};
use crate::frame_distributor::Frame;
use crate::models::BoundingBox;
use std::sync::Arc;

/// Detector set available to the pipeline
#[derive(Clone)]
pub struct Detectors {
    pub object: Arc<dyn ObjectDetector>,
    pub face: Option<Arc<dyn FaceDetector>>,
    pub plate: Option<Arc<dyn PlateReader>>,
}

impl Detectors {
    pub fn new(object: Arc<dyn ObjectDetector>) -> Self {
        Self {
            object,
            face: None,
            plate: None,
        }
    }

    pub fn with_face(mut self, face: Arc<dyn FaceDetector>) -> Self {
        self.face = Some(face);
        self
    }

    pub fn with_plate(mut self, plate: Arc<dyn PlateReader>) -> Self {
        self.plate = Some(plate);
        self
    }
}

/// Merged output of one chain run
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub detection: DetectionResult,
    pub faces: Option<FaceResult>,
    pub plates: Vec<PlateRead>,
    /// Detectors invoked, in invocation order
    pub invoked: Vec<DetectorKind>,
}

impl ChainOutput {
    pub fn face_count(&self) -> usize {
        self.faces.as_ref().map(|f| f.faces.len()).unwrap_or(0)
    }

    /// True when anything at all was found
    pub fn has_findings(&self) -> bool {
        !self.detection.detections.is_empty() || self.face_count() > 0 || !self.plates.is_empty()
    }

    pub fn total_inference_ms(&self) -> f32 {
        self.detection.inference_time_ms
            + self.faces.as_ref().map(|f| f.inference_time_ms).unwrap_or(0.0)
    }
}

/// Run the detector chain for one frame
pub async fn run_chain(detectors: &Detectors, frame: &Frame, config: &EffectiveConfig) -> Result<ChainOutput> {
    if !config.has_detector(DetectorKind::Yolo) {
        return Err(Error::InvalidConfig(format!(
            "camera {} has no object detector configured",
            config.camera_id
        )));
    }

    let params = AnalyzeParams {
        confidence_threshold: config.confidence.yolo,
        class_filter: config.class_filter.clone(),
        ..AnalyzeParams::default()
    };
    let detection = detectors.object.detect(frame, &params).await?;
    let mut invoked = vec![DetectorKind::Yolo];

    let mut faces = None;
    if config.has_detector(DetectorKind::Face) {
        if let Some(face) = &detectors.face {
            let persons: Vec<_> = detection.persons_above(config.confidence.yolo).collect();
            if !persons.is_empty() {
                let regions: Vec<BoundingBox> = persons.iter().map(|p| p.bbox).collect();
                let track_ids: Vec<i32> = if persons.iter().any(|p| p.track_id.is_some()) {
                    persons.iter().map(|p| p.track_id.unwrap_or(0)).collect()
                } else {
                    Vec::new()
                };
                let params = FaceParams {
                    similarity_threshold: config.confidence.face,
                    ..FaceParams::default()
                };
                faces = Some(face.recognize(frame, &regions, &track_ids, &params).await?);
                invoked.push(DetectorKind::Face);
            }
        }
    }

    let mut plates = Vec::new();
    if config.has_detector(DetectorKind::Plate) {
        if let Some(reader) = &detectors.plate {
            let vehicles: Vec<BoundingBox> = detection
                .vehicles_above(config.confidence.yolo)
                .map(|v| v.bbox)
                .collect();
            if !vehicles.is_empty() {
                plates = reader.read_plates(frame, &vehicles).await?;
                plates.retain(|p| p.confidence >= config.confidence.plate);
                invoked.push(DetectorKind::Plate);
            }
        }
    }

    Ok(ChainOutput {
        detection,
        faces,
        plates,
        invoked,
    })
}
