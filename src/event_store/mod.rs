//! EventStore - Detection Event Recording (Ring Buffer)
//!
//! ## Responsibilities
//!
//! - Record detection events published by the pipeline
//! - Serve them back for playback (latest, per camera)
//!
//! The in-memory store keeps the newest `capacity` events; older ones are
//! evicted first. Event ids are assigned on record and never reused.

use crate::config_store::DetectionMode;
use crate::detector_client::{Detection, FaceMatch, PlateRead, ThreatCategorization, ThreatLevel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Default ring buffer capacity
pub const DEFAULT_CAPACITY: usize = 2000;

/// Detection event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by the store; 0 until recorded
    pub event_id: u64,
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub mode: DetectionMode,
    /// Most significant detected class, or "face" when only faces were seen
    pub primary_event: String,
    pub threat: Option<ThreatLevel>,
    pub categorization: ThreatCategorization,
    pub detections: Vec<Detection>,
    pub faces: Vec<FaceMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plates: Vec<PlateRead>,
    pub inference_ms: f32,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Primary class for a categorization: first class of the highest tier
    pub fn primary_class(categorization: &ThreatCategorization, has_faces: bool) -> String {
        categorization
            .high
            .first()
            .or_else(|| categorization.medium.first())
            .or_else(|| categorization.low.first())
            .cloned()
            .unwrap_or_else(|| if has_faces { "face" } else { "none" }.to_string())
    }

    pub fn known_faces(&self) -> usize {
        self.faces.iter().filter(|f| f.is_known).count()
    }
}

/// Event persistence seam
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Store an event, returning its assigned id
    async fn record(&self, event: Event) -> u64;

    /// Newest first
    async fn latest(&self, count: usize) -> Vec<Event>;

    /// Newest first, one camera
    async fn by_camera(&self, camera_id: &str, count: usize) -> Vec<Event>;

    async fn count(&self) -> usize;
}

struct EventRing {
    events: VecDeque<Event>,
    capacity: usize,
    next_id: u64,
}

impl EventRing {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    fn push(&mut self, mut event: Event) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        event.event_id = id;

        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
        id
    }
}

/// In-memory event store
pub struct InMemoryEventStore {
    ring: RwLock<EventRing>,
}

impl InMemoryEventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(EventRing::new(capacity)),
        }
    }

    pub async fn capacity(&self) -> usize {
        self.ring.read().await.capacity
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record(&self, event: Event) -> u64 {
        let camera_id = event.camera_id.clone();
        let id = self.ring.write().await.push(event);
        tracing::debug!(event_id = id, camera_id = %camera_id, "Event recorded");
        id
    }

    async fn latest(&self, count: usize) -> Vec<Event> {
        let ring = self.ring.read().await;
        ring.events.iter().rev().take(count).cloned().collect()
    }

    async fn by_camera(&self, camera_id: &str, count: usize) -> Vec<Event> {
        let ring = self.ring.read().await;
        ring.events
            .iter()
            .rev()
            .filter(|e| e.camera_id == camera_id)
            .take(count)
            .cloned()
            .collect()
    }

    async fn count(&self) -> usize {
        self.ring.read().await.events.len()
    }
}
