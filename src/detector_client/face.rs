//! Face recognition client
//!
//! Streams frames to `FaceRecognitionService/RecognizeStream`. Person boxes
//! from the object detector are passed as region hints.

use super::proto::{self, recognition as pb};
use super::rpc::{InboundStream, RpcSettings, RpcStats, StreamTransport, StreamingRpc};
use super::types::{FaceMatch, FaceParams, FaceResult, HealthStatus};
use super::{connect_lazy, request_stream, FaceDetector};
use crate::error::{Error, Result};
use crate::frame_distributor::Frame;
use crate::models::BoundingBox;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tonic::transport::Channel;

/// gRPC transport to `recognition.v1.FaceRecognitionService`
#[derive(Clone)]
pub struct GrpcFaceTransport {
    channel: Channel,
}

impl GrpcFaceTransport {
    pub fn connect_lazy(endpoint: &str) -> Result<Self> {
        Ok(Self {
            channel: connect_lazy(endpoint)?,
        })
    }

    fn client(&self) -> pb::FaceRecognitionServiceClient {
        pb::FaceRecognitionServiceClient::new(self.channel.clone())
    }
}

#[async_trait]
impl StreamTransport for GrpcFaceTransport {
    type Request = pb::FaceRequest;
    type Response = pb::FaceResponse;

    async fn open_stream(
        &self,
        outbound: mpsc::Receiver<pb::FaceRequest>,
    ) -> Result<InboundStream<pb::FaceResponse>> {
        proto::ready(&self.channel).await?;
        let mut client = self.client();

        let call = async move {
            match client.recognize_stream(request_stream(outbound)).await {
                Ok(response) => response
                    .into_inner()
                    .map(|item| item.map_err(Error::from))
                    .boxed(),
                Err(status) => futures::stream::once(async move { Err(Error::from(status)) }).boxed(),
            }
        };
        Ok(futures::stream::once(call).flatten().boxed())
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let mut client = self.client();
        let response = client.health_check(pb::HealthRequest {}).await?.into_inner();
        Ok(HealthStatus {
            status: response.status,
            model_loaded: response.model_loaded,
            device: response.device,
            checked_at: Utc::now(),
            error: None,
        })
    }
}

fn face_match(face: &pb::Face) -> Option<FaceMatch> {
    let b = face.bbox.as_ref()?;
    Some(FaceMatch {
        bbox: BoundingBox::new(b.x1, b.y1, b.x2, b.y2),
        confidence: face.confidence,
        identity: (face.is_known && !face.identity.is_empty()).then(|| face.identity.clone()),
        similarity: face.similarity,
        is_known: face.is_known,
        age: (face.age > 0).then_some(face.age as u32),
        gender: (!face.gender.is_empty()).then(|| face.gender.clone()),
        track_id: (face.associated_track_id != 0).then_some(face.associated_track_id),
    })
}

/// Face recognition client
pub struct FaceClient<T = GrpcFaceTransport>
where
    T: StreamTransport<Request = pb::FaceRequest, Response = pb::FaceResponse>,
{
    rpc: StreamingRpc<T>,
}

impl FaceClient<GrpcFaceTransport> {
    pub fn connect_lazy(endpoint: &str, settings: RpcSettings) -> Result<Self> {
        Ok(Self::new(GrpcFaceTransport::connect_lazy(endpoint)?, settings))
    }
}

impl<T> FaceClient<T>
where
    T: StreamTransport<Request = pb::FaceRequest, Response = pb::FaceResponse>,
{
    pub fn new(transport: T, settings: RpcSettings) -> Self {
        Self {
            rpc: StreamingRpc::new("face", transport, settings),
        }
    }

    /// Recognize faces, restricted to the given person regions when any
    pub async fn recognize(
        &self,
        frame: &Frame,
        regions: &[BoundingBox],
        track_ids: &[i32],
        params: &FaceParams,
    ) -> Result<FaceResult> {
        let request = pb::FaceRequest {
            camera_id: frame.camera_id.clone(),
            frame_seq: frame.sequence,
            timestamp_ns: frame.captured_at.timestamp_nanos_opt().unwrap_or_default(),
            jpeg_data: frame.jpeg.clone(),
            return_annotated: params.return_annotated,
            similarity_threshold: params.similarity_threshold,
            person_regions: regions
                .iter()
                .map(|r| pb::BBox {
                    x1: r.x1,
                    y1: r.y1,
                    x2: r.x2,
                    y2: r.y2,
                })
                .collect(),
            person_track_ids: track_ids.to_vec(),
        };

        let camera_id = frame.camera_id.clone();
        let sequence = frame.sequence;
        let response = self
            .rpc
            .call(request, params.timeout, move |r: &pb::FaceResponse| {
                r.frame_seq == sequence && r.camera_id == camera_id
            })
            .await?;

        let faces: Vec<FaceMatch> = response.faces.iter().filter_map(face_match).collect();
        let known_count = faces.iter().filter(|f| f.is_known).count();
        let unknown_count = faces.len() - known_count;

        tracing::debug!(
            camera_id = %frame.camera_id,
            sequence = frame.sequence,
            regions = regions.len(),
            faces = faces.len(),
            known = known_count,
            inference_ms = response.inference_ms,
            "Face recognition complete"
        );

        Ok(FaceResult {
            faces,
            known_count,
            unknown_count,
            annotated_jpeg: (!response.annotated_jpeg.is_empty()).then(|| response.annotated_jpeg.clone()),
            inference_time_ms: response.inference_ms,
            device: response.device,
        })
    }

    pub async fn health(&self) -> HealthStatus {
        self.rpc.health().await
    }

    pub async fn stats(&self) -> RpcStats {
        self.rpc.stats().await
    }
}

#[async_trait]
impl<T> FaceDetector for FaceClient<T>
where
    T: StreamTransport<Request = pb::FaceRequest, Response = pb::FaceResponse>,
{
    async fn recognize(
        &self,
        frame: &Frame,
        regions: &[BoundingBox],
        track_ids: &[i32],
        params: &FaceParams,
    ) -> Result<FaceResult> {
        FaceClient::recognize(self, frame, regions, track_ids, params).await
    }

    async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Replies with one known face per region hint
    #[derive(Clone, Default)]
    struct RegionEcho {
        last_regions: Arc<Mutex<Vec<pb::BBox>>>,
    }

    #[async_trait]
    impl StreamTransport for RegionEcho {
        type Request = pb::FaceRequest;
        type Response = pb::FaceResponse;

        async fn open_stream(
            &self,
            outbound: mpsc::Receiver<pb::FaceRequest>,
        ) -> Result<InboundStream<pb::FaceResponse>> {
            let last = self.last_regions.clone();
            Ok(request_stream(outbound)
                .then(move |req| {
                    let last = last.clone();
                    async move {
                        *last.lock().await = req.person_regions.clone();
                        let faces = req
                            .person_regions
                            .iter()
                            .zip(req.person_track_ids.iter().chain(std::iter::repeat(&0)))
                            .map(|(region, track)| pb::Face {
                                bbox: Some(region.clone()),
                                confidence: 0.9,
                                identity: "alice".to_string(),
                                similarity: 0.8,
                                is_known: true,
                                age: 0,
                                gender: String::new(),
                                associated_track_id: *track,
                            })
                            .collect::<Vec<_>>();
                        Ok(pb::FaceResponse {
                            camera_id: req.camera_id,
                            frame_seq: req.frame_seq,
                            total_faces: faces.len() as i32,
                            known_faces: faces.len() as i32,
                            faces,
                            inference_ms: 4.0,
                            device: "cpu".to_string(),
                            ..Default::default()
                        })
                    }
                })
                .boxed())
        }

        async fn health_check(&self) -> Result<HealthStatus> {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                model_loaded: true,
                device: "cpu".to_string(),
                checked_at: Utc::now(),
                error: None,
            })
        }
    }

    #[tokio::test]
    async fn test_regions_are_forwarded() {
        let transport = RegionEcho::default();
        let client = FaceClient::new(transport.clone(), RpcSettings::default());
        let frame = Frame::new("cam1", 3, Bytes::from_static(b"jpeg"));
        let regions = [BoundingBox::new(10.0, 10.0, 50.0, 120.0)];

        let result = client
            .recognize(&frame, &regions, &[4], &FaceParams::default())
            .await
            .unwrap();

        assert_eq!(transport.last_regions.lock().await.len(), 1);
        assert_eq!(result.faces.len(), 1);
        assert_eq!(result.known_count, 1);
        assert_eq!(result.unknown_count, 0);
        assert_eq!(result.faces[0].identity.as_deref(), Some("alice"));
        assert_eq!(result.faces[0].track_id, Some(4));
        assert_eq!(result.faces[0].age, None);
    }
}
