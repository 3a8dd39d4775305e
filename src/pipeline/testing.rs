//! In-process detector fakes for pipeline tests

use crate::detector_client::{
    threat_level, AnalyzeParams, Detection, DetectionResult, FaceDetector, FaceMatch, FaceParams,
    FaceResult, ObjectDetector, PlateRead, PlateReader, ThreatCategorization, YoloTask,
};
use crate::error::{Error, Result};
use crate::frame_distributor::Frame;
use crate::models::BoundingBox;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn result_with(camera_id: &str, sequence: u64, classes: &[(&str, f32)]) -> DetectionResult {
    let detections: Vec<Detection> = classes
        .iter()
        .enumerate()
        .map(|(i, (class, confidence))| {
            let x = 10.0 + i as f32 * 40.0;
            Detection {
                class_name: class.to_string(),
                class_id: i as i32,
                confidence: *confidence,
                bbox: BoundingBox::new(x, 10.0, x + 30.0, 60.0),
                track_id: None,
                source: YoloTask::Detect,
                threat: threat_level(class),
            }
        })
        .collect();
    DetectionResult {
        camera_id: camera_id.to_string(),
        sequence,
        per_task: Default::default(),
        threat: ThreatCategorization::from_detections(&detections),
        detections,
        annotated_jpeg: None,
        inference_time_ms: 5.0,
        device: "fake".to_string(),
    }
}

pub struct FakeObject {
    classes: Vec<(String, f32)>,
    fail_on: Vec<u64>,
    calls: AtomicUsize,
}

impl FakeObject {
    pub fn returning(classes: Vec<(&str, f32)>) -> Arc<Self> {
        Arc::new(Self {
            classes: classes.into_iter().map(|(c, s)| (c.to_string(), s)).collect(),
            fail_on: Vec::new(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Finds one person, fails for the listed sequences
    pub fn failing_on(sequences: Vec<u64>) -> Arc<Self> {
        Arc::new(Self {
            classes: vec![("person".to_string(), 0.9)],
            fail_on: sequences,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectDetector for FakeObject {
    async fn detect(&self, frame: &Frame, _params: &AnalyzeParams) -> Result<DetectionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&frame.sequence) {
            return Err(Error::ServiceUnavailable("fake stream broken".to_string()));
        }
        let classes: Vec<(&str, f32)> = self.classes.iter().map(|(c, s)| (c.as_str(), *s)).collect();
        Ok(result_with(&frame.camera_id, frame.sequence, &classes))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

pub struct FakeFace {
    calls: AtomicUsize,
    regions: Mutex<Vec<BoundingBox>>,
    observed: Option<Arc<FakeObject>>,
    seen: Mutex<Vec<usize>>,
}

impl FakeFace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            regions: Mutex::new(Vec::new()),
            observed: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Records the object detector's call count each time it is invoked
    pub fn observing(object: Arc<FakeObject>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            regions: Mutex::new(Vec::new()),
            observed: Some(object),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_regions(&self) -> Vec<BoundingBox> {
        self.regions.lock().unwrap().clone()
    }

    pub fn object_calls_seen(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl FaceDetector for FakeFace {
    async fn recognize(
        &self,
        _frame: &Frame,
        regions: &[BoundingBox],
        _track_ids: &[i32],
        _params: &FaceParams,
    ) -> Result<FaceResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.regions.lock().unwrap() = regions.to_vec();
        if let Some(object) = &self.observed {
            self.seen.lock().unwrap().push(object.calls());
        }
        let faces: Vec<FaceMatch> = regions
            .iter()
            .map(|r| FaceMatch {
                bbox: BoundingBox::new(r.x1, r.y1, r.x2, r.y1 + r.height() / 3.0),
                confidence: 0.9,
                identity: None,
                similarity: 0.0,
                is_known: false,
                age: None,
                gender: None,
                track_id: None,
            })
            .collect();
        Ok(FaceResult {
            known_count: 0,
            unknown_count: faces.len(),
            faces,
            annotated_jpeg: None,
            inference_time_ms: 3.0,
            device: "fake".to_string(),
        })
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

pub struct FakePlate {
    calls: AtomicUsize,
}

impl FakePlate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlateReader for FakePlate {
    async fn read_plates(&self, _frame: &Frame, vehicles: &[BoundingBox]) -> Result<Vec<PlateRead>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vehicles
            .iter()
            .map(|v| PlateRead {
                bbox: *v,
                text: "ABC123".to_string(),
                confidence: 0.9,
            })
            .collect())
    }
}

/// Small black JPEG the overlay can decode
pub fn black_jpeg() -> bytes::Bytes {
    let image = image::RgbImage::new(160, 120);
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 80)
        .encode_image(&image)
        .unwrap();
    bytes::Bytes::from(buf)
}

/// Annotated-frame sink that remembers what it saw
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Arc<crate::pipeline::AnnotatedFrame>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.sequence).collect()
    }
}

#[async_trait]
impl crate::pipeline::AnnotatedFrameSink for RecordingSink {
    async fn publish_annotated(&self, frame: Arc<crate::pipeline::AnnotatedFrame>) {
        self.frames.lock().unwrap().push(frame);
    }
}
