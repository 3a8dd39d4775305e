//! Detection config validation
//!
//! Rejected configs never reach the store.

use super::types::{DetectionMode, DetectorKind, EffectiveConfig, GlobalDetectionConfig};
use crate::error::{Error, Result};

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(Error::InvalidConfig(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Detector ordering: object detector first, each detector at most once.
/// face and plate depend on yolo output so they cannot precede or replace it.
pub fn validate_detectors(mode: DetectionMode, detectors: &[DetectorKind]) -> Result<()> {
    if detectors.is_empty() {
        if mode == DetectionMode::Disabled {
            return Ok(());
        }
        return Err(Error::InvalidConfig(format!(
            "mode {} requires at least one detector",
            mode.as_str()
        )));
    }

    if detectors[0] != DetectorKind::Yolo {
        return Err(Error::InvalidConfig(format!(
            "detector chain must start with yolo, got {}",
            detectors[0].as_str()
        )));
    }

    for (i, kind) in detectors.iter().enumerate() {
        if detectors[..i].contains(kind) {
            return Err(Error::InvalidConfig(format!(
                "detector {} listed more than once",
                kind.as_str()
            )));
        }
    }

    Ok(())
}

fn validate_fields(config: &EffectiveConfig) -> Result<()> {
    validate_detectors(config.mode, &config.detectors)?;

    if matches!(config.mode, DetectionMode::Scheduled | DetectionMode::Hybrid)
        && config.schedule_interval_ms == 0
    {
        return Err(Error::InvalidConfig(
            "schedule_interval_ms must be greater than 0 for scheduled modes".to_string(),
        ));
    }

    check_unit("motion_sensitivity", config.motion_sensitivity)?;
    check_unit("confidence.yolo", config.confidence.yolo)?;
    check_unit("confidence.face", config.confidence.face)?;
    check_unit("confidence.plate", config.confidence.plate)?;

    let thickness = config.overlay.box_thickness;
    if thickness == 0 || thickness > 20 {
        return Err(Error::InvalidConfig(format!(
            "overlay.box_thickness must be within 1..=20, got {}",
            thickness
        )));
    }

    Ok(())
}

pub fn validate_global(config: &GlobalDetectionConfig) -> Result<()> {
    validate_fields(&EffectiveConfig::merge("global", config, None))
}

pub fn validate_effective(config: &EffectiveConfig) -> Result<()> {
    validate_fields(config).map_err(|e| match e {
        Error::InvalidConfig(msg) => {
            Error::InvalidConfig(format!("camera {}: {}", config.camera_id, msg))
        }
        other => other,
    })
}
