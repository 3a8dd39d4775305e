//! DetectorClient - External Inference Service Adapters
//!
//! ## Responsibilities
//!
//! - One long-lived bidirectional gRPC stream per detector service
//! - Lazy (re)connection, cached health checks, bounded call latency
//! - Convert multi-task responses into one structured detection list
//! - Threat tier assignment per detected class
//!
//! ## Design Principles
//!
//! - One in-flight analyze call per client (single-flight correlation)
//! - Failures surface as `ServiceUnavailable` / `Timeout`, never panics
//! - The pipeline only sees the `ObjectDetector` / `FaceDetector` seams

pub mod face;
pub mod proto;
pub mod rpc;
pub mod threat;
pub mod types;
pub mod yolo;

pub use face::{FaceClient, GrpcFaceTransport};
pub use rpc::{RpcSettings, RpcStats, StreamTransport, StreamingRpc};
pub use threat::{threat_level, ThreatCategorization, ThreatLevel};
pub use types::*;
pub use yolo::{GrpcYoloTransport, YoloClient, YoloTransport};

use crate::error::Result;
use crate::frame_distributor::Frame;
use crate::models::BoundingBox;
use async_trait::async_trait;
use futures::Stream;
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

/// Object detector seam used by the pipeline
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, frame: &Frame, params: &AnalyzeParams) -> Result<DetectionResult>;

    async fn is_healthy(&self) -> bool;
}

/// Face detector seam used by the pipeline
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn recognize(
        &self,
        frame: &Frame,
        regions: &[BoundingBox],
        track_ids: &[i32],
        params: &FaceParams,
    ) -> Result<FaceResult>;

    async fn is_healthy(&self) -> bool;
}

/// License plate reader seam. No production implementation yet.
#[async_trait]
pub trait PlateReader: Send + Sync {
    async fn read_plates(&self, frame: &Frame, vehicles: &[BoundingBox]) -> Result<Vec<PlateRead>>;
}

/// Lazily connected channel with keepalive settings for long-lived streams
pub(crate) fn connect_lazy(endpoint: &str) -> Result<Channel> {
    let channel = Endpoint::from_shared(endpoint.to_string())?
        .connect_timeout(Duration::from_secs(5))
        .http2_keep_alive_interval(Duration::from_secs(10))
        .keep_alive_timeout(Duration::from_secs(5))
        .keep_alive_while_idle(true)
        .connect_lazy();
    Ok(channel)
}

/// Turn the send task's wire queue into a request stream
pub(crate) fn request_stream<T: Send + 'static>(
    rx: mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}
