//! Threat categorization
//!
//! Fixed class → tier table used for alert priority.

use super::types::Detection;
use serde::{Deserialize, Serialize};

/// Alert priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
        }
    }
}

const VEHICLE_CLASSES: &[&str] = &["car", "truck", "bus", "motorcycle"];

/// Motor vehicle classes
pub fn is_vehicle(class_name: &str) -> bool {
    VEHICLE_CLASSES.contains(&class_name)
}

/// Tier for a detected class
pub fn threat_level(class_name: &str) -> ThreatLevel {
    if class_name == "person" {
        ThreatLevel::High
    } else if is_vehicle(class_name) {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

/// Detected classes grouped by tier, first-seen order, no duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatCategorization {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl ThreatCategorization {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut result = Self::default();
        for detection in detections {
            let tier = match threat_level(&detection.class_name) {
                ThreatLevel::High => &mut result.high,
                ThreatLevel::Medium => &mut result.medium,
                ThreatLevel::Low => &mut result.low,
            };
            if !tier.contains(&detection.class_name) {
                tier.push(detection.class_name.clone());
            }
        }
        result
    }

    /// Highest tier present, None when nothing was detected
    pub fn highest(&self) -> Option<ThreatLevel> {
        if !self.high.is_empty() {
            Some(ThreatLevel::High)
        } else if !self.medium.is_empty() {
            Some(ThreatLevel::Medium)
        } else if !self.low.is_empty() {
            Some(ThreatLevel::Low)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.highest().is_none()
    }
}
