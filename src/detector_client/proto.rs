//! Wire types and gRPC clients for the detector services
//!
//! Generated at build time from `proto/detection.proto` (`detection.v1`,
//! object detection) and `proto/recognition.proto` (`recognition.v1`, face
//! recognition). Module paths mirror the proto packages.

use tonic::transport::Channel;

/// `detection.v1` package
pub mod detection {
    pub mod v1 {
        tonic::include_proto!("detection.v1");
    }

    pub use v1::*;

    pub type DetectionServiceClient =
        v1::detection_service_client::DetectionServiceClient<tonic::transport::Channel>;
}

/// `recognition.v1` package
pub mod recognition {
    pub mod v1 {
        tonic::include_proto!("recognition.v1");
    }

    pub use super::detection::{BBox, HealthRequest, HealthResponse};
    pub use v1::*;

    pub type FaceRecognitionServiceClient =
        v1::face_recognition_service_client::FaceRecognitionServiceClient<tonic::transport::Channel>;
}

/// Wait until the channel is connected
pub async fn ready(channel: &Channel) -> Result<(), tonic::Status> {
    tonic::client::Grpc::new(channel.clone())
        .ready()
        .await
        .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {}", e)))
}
