//! MotionSignal - Per-camera "motion present" signal
//!
//! ## Responsibilities
//!
//! - Expose `is_motion_active(camera_id)` to the detection pipeline
//! - Accept motion reports from external motion detectors (boolean or score)
//!
//! The motion heuristic itself lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Motion signal provider
#[async_trait]
pub trait MotionSignal: Send + Sync {
    async fn is_motion_active(&self, camera_id: &str) -> bool;
}

/// Last reported motion state for a camera
#[derive(Debug, Clone, Serialize)]
pub struct MotionState {
    pub active: bool,
    /// Last score reported, when the reporter supplied one
    pub score: Option<f32>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory motion tracker fed by external reports
pub struct MotionTracker {
    states: RwLock<HashMap<String, MotionState>>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Record a boolean motion report
    pub async fn report(&self, camera_id: &str, active: bool) {
        self.set(camera_id, active, None).await;
    }

    /// Record a motion score; motion is active when score >= sensitivity
    pub async fn report_score(&self, camera_id: &str, score: f32, sensitivity: f32) -> bool {
        let active = score >= sensitivity;
        self.set(camera_id, active, Some(score)).await;
        active
    }

    async fn set(&self, camera_id: &str, active: bool, score: Option<f32>) {
        let mut states = self.states.write().await;
        let changed = states
            .get(camera_id)
            .map(|s| s.active != active)
            .unwrap_or(active);
        states.insert(
            camera_id.to_string(),
            MotionState {
                active,
                score,
                updated_at: Utc::now(),
            },
        );
        if changed {
            tracing::debug!(camera_id = %camera_id, active, "Motion state changed");
        }
    }

    pub async fn state(&self, camera_id: &str) -> Option<MotionState> {
        self.states.read().await.get(camera_id).cloned()
    }

    /// Forget a camera (on deactivation)
    pub async fn remove(&self, camera_id: &str) {
        self.states.write().await.remove(camera_id);
    }
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotionSignal for MotionTracker {
    async fn is_motion_active(&self, camera_id: &str) -> bool {
        self.states
            .read()
            .await
            .get(camera_id)
            .map(|s| s.active)
            .unwrap_or(false)
    }
}
