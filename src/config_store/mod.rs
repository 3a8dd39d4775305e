//! ConfigStore - Detection Configuration (SSoT)
//!
//! ## Responsibilities
//!
//! - Global detection defaults
//! - Per-camera overrides merged into `EffectiveConfig`
//! - Validation before any update is applied
//! - YOLO runtime parameters pushed through Configure
//!
//! ## Design Principles
//!
//! - The pipeline reads an immutable `Arc<EffectiveConfig>` snapshot per frame
//! - Updates build new snapshots and swap them in; locks are held only for the swap

mod types;
mod validation;

pub use types::*;
pub use validation::{validate_detectors, validate_effective, validate_global};

use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// ConfigStore instance
pub struct ConfigStore {
    global: RwLock<Arc<GlobalDetectionConfig>>,
    overrides: RwLock<HashMap<String, CameraDetectionConfig>>,
    /// Merged snapshots, rebuilt on every update
    snapshots: RwLock<HashMap<String, Arc<EffectiveConfig>>>,
    yolo_runtime: RwLock<YoloRuntimeConfig>,
}

impl ConfigStore {
    /// Create new ConfigStore from validated global defaults
    pub fn new(global: GlobalDetectionConfig) -> Result<Self> {
        validate_global(&global)?;
        let yolo_runtime = YoloRuntimeConfig {
            confidence_threshold: global.confidence.yolo,
            class_filter: global.class_filter.clone(),
            ..YoloRuntimeConfig::default()
        };
        Ok(Self {
            global: RwLock::new(Arc::new(global)),
            overrides: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            yolo_runtime: RwLock::new(yolo_runtime),
        })
    }

    /// Current global defaults
    pub async fn global(&self) -> Arc<GlobalDetectionConfig> {
        self.global.read().await.clone()
    }

    /// Per-camera overrides as stored
    pub async fn camera_overrides(&self, camera_id: &str) -> Option<CameraDetectionConfig> {
        self.overrides.read().await.get(camera_id).cloned()
    }

    /// Consistent configuration snapshot for one camera
    pub async fn snapshot(&self, camera_id: &str) -> Arc<EffectiveConfig> {
        if let Some(snapshot) = self.snapshots.read().await.get(camera_id) {
            return snapshot.clone();
        }

        // Held until the insert so a concurrent update cannot be overwritten
        // by a snapshot merged from the previous global config
        let overrides = self.overrides.read().await;
        let global = self.global().await;
        let snapshot = Arc::new(EffectiveConfig::merge(
            camera_id,
            &global,
            overrides.get(camera_id),
        ));

        let snapshot = self
            .snapshots
            .write()
            .await
            .entry(camera_id.to_string())
            .or_insert(snapshot)
            .clone();
        drop(overrides);
        snapshot
    }

    /// Replace the global defaults
    ///
    /// Every camera with overrides is re-merged and re-validated first; the
    /// update is rejected as a whole if any camera would become invalid.
    pub async fn update_global(&self, config: GlobalDetectionConfig) -> Result<Arc<GlobalDetectionConfig>> {
        validate_global(&config)?;

        let overrides = self.overrides.write().await;
        let mut rebuilt = HashMap::with_capacity(overrides.len());
        for (camera_id, camera) in overrides.iter() {
            let merged = EffectiveConfig::merge(camera_id, &config, Some(camera));
            validate_effective(&merged)?;
            rebuilt.insert(camera_id.clone(), Arc::new(merged));
        }

        let config = Arc::new(config);
        {
            let mut global = self.global.write().await;
            let mut snapshots = self.snapshots.write().await;
            *global = config.clone();
            *snapshots = rebuilt;
        }
        drop(overrides);

        tracing::info!(
            mode = %config.mode.as_str(),
            detectors = ?config.detectors,
            "Global detection config updated"
        );
        Ok(config)
    }

    /// Replace a camera's overrides
    pub async fn update_camera(
        &self,
        camera_id: &str,
        camera: CameraDetectionConfig,
    ) -> Result<Arc<EffectiveConfig>> {
        let mut overrides = self.overrides.write().await;
        let global = self.global().await;
        let merged = EffectiveConfig::merge(camera_id, &global, Some(&camera));
        validate_effective(&merged)?;

        let merged = Arc::new(merged);
        overrides.insert(camera_id.to_string(), camera);
        self.snapshots
            .write()
            .await
            .insert(camera_id.to_string(), merged.clone());
        drop(overrides);

        tracing::info!(
            camera_id = %camera_id,
            mode = %merged.mode.as_str(),
            detectors = ?merged.detectors,
            "Camera detection config updated"
        );
        Ok(merged)
    }

    /// Drop a camera's overrides so it inherits the global defaults again
    pub async fn clear_camera(&self, camera_id: &str) -> bool {
        let mut overrides = self.overrides.write().await;
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(camera_id);
        overrides.remove(camera_id).is_some()
    }

    /// Last YOLO runtime parameters pushed through Configure
    pub async fn yolo_runtime(&self) -> YoloRuntimeConfig {
        self.yolo_runtime.read().await.clone()
    }

    /// Record YOLO runtime parameters and fold threshold / class filter into
    /// the global defaults. Nothing else changes.
    pub async fn apply_yolo_runtime(&self, runtime: YoloRuntimeConfig) -> Result<YoloRuntimeConfig> {
        let mut global = (*self.global().await).clone();
        global.confidence.yolo = runtime.confidence_threshold;
        global.class_filter = runtime.class_filter.clone();
        self.update_global(global).await?;

        *self.yolo_runtime.write().await = runtime.clone();
        Ok(runtime)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            global: RwLock::new(Arc::new(GlobalDetectionConfig::default())),
            overrides: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            yolo_runtime: RwLock::new(YoloRuntimeConfig::default()),
        }
    }
}
