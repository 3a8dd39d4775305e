//! Vigil Camserver Library
//!
//! Video alarm backend core
//!
//! ## Architecture
//!
//! 1. FrameDistributor - Per-camera frame fan-out, drop on full
//! 2. DetectorClient - YOLO / face recognition over bidirectional gRPC
//! 3. Pipeline - Mode gating, detector chain, overlay, events
//! 4. StreamPublisher - Multipart MJPEG and binary WebSocket viewers
//! 5. ConfigStore - Global detection defaults and per-camera overrides
//! 6. EventStore - Detection event ring
//! 7. RealtimeHub - Dashboard WebSocket push
//! 8. CameraManager - Activation and teardown
//! 9. WebAPI - HTTP / WebSocket surface
//!
//! ## Design Principles
//!
//! - A slow consumer never stalls capture or another consumer
//! - Only the pipeline draws; publishers relay bytes as produced

pub mod camera_manager;
pub mod config_store;
pub mod detector_client;
pub mod error;
pub mod event_store;
pub mod frame_distributor;
pub mod frame_source;
pub mod models;
pub mod motion_signal;
pub mod overlay;
pub mod pipeline;
pub mod realtime_hub;
pub mod state;
pub mod stream_publisher;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
