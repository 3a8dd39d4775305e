//! StreamPublisher - Live Viewer Distribution
//!
//! ## Responsibilities
//!
//! - Relay raw frames from the frame distributor to connected viewers
//! - Relay annotated frames from the detection pipeline
//! - One bounded queue per viewer, drop on full
//!
//! Two publishers share the same source contract and differ in wire format:
//! `multipart` (MJPEG over HTTP) and `binary_socket` (framed WebSocket).
//! Neither draws anything; annotated bytes are relayed as produced.

pub mod binary_socket;
pub mod multipart;
pub mod wire;

pub use binary_socket::{
    should_deliver_raw, BinarySocketPublisher, ClientMode, SocketViewer, WriteEnd,
};
pub use multipart::{MultipartPublisher, MultipartViewer};

use crate::error::Result;
use crate::pipeline::AnnotatedFrameSink;
use async_trait::async_trait;
use serde::Serialize;

/// Per-camera viewer statistics
#[derive(Debug, Clone, Serialize)]
pub struct ViewerStats {
    pub publisher: &'static str,
    pub camera_id: String,
    pub viewers: usize,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
}

/// Common lifecycle of a stream publisher
#[async_trait]
pub trait StreamPublisher: AnnotatedFrameSink {
    fn kind(&self) -> &'static str;

    /// Start relaying a camera's raw frames. Returns false if already attached.
    async fn attach(&self, camera_id: &str) -> Result<bool>;

    /// Stop relaying and disconnect every viewer of the camera
    async fn detach(&self, camera_id: &str) -> bool;

    async fn stats(&self, camera_id: &str) -> Option<ViewerStats>;
}
