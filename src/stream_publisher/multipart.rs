//! Multipart (MJPEG) publisher
//!
//! Every frame, raw or annotated, is pushed to every viewer's queue as one
//! `multipart/x-mixed-replace` part. A full queue drops the part for that
//! viewer. A viewer disconnects by dropping its body stream.

use super::wire::{multipart_content_type, multipart_part};
use super::{StreamPublisher, ViewerStats};
use crate::error::{Error, Result};
use crate::frame_distributor::FrameDistributor;
use crate::pipeline::{AnnotatedFrame, AnnotatedFrameSink};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Viewers of one camera
struct ViewerSet {
    camera_id: String,
    viewers: RwLock<HashMap<u64, mpsc::Sender<Bytes>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ViewerSet {
    async fn push(&self, jpeg: &[u8]) {
        let mut viewers = self.viewers.write().await;
        if viewers.is_empty() {
            return;
        }

        let part = multipart_part(jpeg);
        let mut gone = Vec::new();
        for (id, tx) in viewers.iter() {
            match tx.try_send(part.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            viewers.remove(&id);
            tracing::debug!(camera_id = %self.camera_id, viewer_id = id, "Multipart viewer gone");
        }
    }
}

struct MultipartCamera {
    viewers: Arc<ViewerSet>,
    relay: JoinHandle<()>,
}

impl Drop for MultipartCamera {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// Connected multipart viewer
pub struct MultipartViewer {
    pub id: u64,
    pub camera_id: String,
    rx: mpsc::Receiver<Bytes>,
}

impl MultipartViewer {
    /// Build the streaming HTTP response for this viewer
    pub fn into_response(self) -> Result<Response> {
        let stream = futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|part| (Ok::<Bytes, Infallible>(part), rx))
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, multipart_content_type())
            .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(header::CONNECTION, "close")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(stream))
            .map_err(|e| Error::Internal(format!("multipart response: {}", e)))
    }

    /// Next queued part (tests and non-HTTP consumers)
    pub async fn next_part(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// MultipartPublisher instance
pub struct MultipartPublisher {
    distributor: Arc<FrameDistributor>,
    cameras: RwLock<HashMap<String, MultipartCamera>>,
    queue_depth: usize,
    next_viewer_id: AtomicU64,
}

impl MultipartPublisher {
    pub fn new(distributor: Arc<FrameDistributor>, queue_depth: usize) -> Self {
        Self {
            distributor,
            cameras: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
            next_viewer_id: AtomicU64::new(1),
        }
    }

    /// Add a viewer to an attached camera
    pub async fn connect(&self, camera_id: &str) -> Result<MultipartViewer> {
        let cameras = self.cameras.read().await;
        let camera = cameras
            .get(camera_id)
            .ok_or_else(|| Error::NotFound(format!("stream for camera {}", camera_id)))?;

        let id = self.next_viewer_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let count = {
            let mut viewers = camera.viewers.viewers.write().await;
            viewers.insert(id, tx);
            viewers.len()
        };

        tracing::info!(camera_id = %camera_id, viewer_id = id, viewers = count, "Multipart viewer connected");
        Ok(MultipartViewer {
            id,
            camera_id: camera_id.to_string(),
            rx,
        })
    }
}

#[async_trait]
impl AnnotatedFrameSink for MultipartPublisher {
    async fn publish_annotated(&self, frame: Arc<AnnotatedFrame>) {
        let viewers = self
            .cameras
            .read()
            .await
            .get(&frame.camera_id)
            .map(|c| c.viewers.clone());
        if let Some(viewers) = viewers {
            viewers.push(&frame.jpeg).await;
        }
    }
}

#[async_trait]
impl StreamPublisher for MultipartPublisher {
    fn kind(&self) -> &'static str {
        "multipart"
    }

    async fn attach(&self, camera_id: &str) -> Result<bool> {
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(camera_id) {
            return Ok(false);
        }

        let mut subscription = self.distributor.subscribe(camera_id, self.queue_depth).await?;
        let viewers = Arc::new(ViewerSet {
            camera_id: camera_id.to_string(),
            viewers: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let relay_viewers = viewers.clone();
        let relay = tokio::spawn(async move {
            while let Some(frame) = subscription.recv().await {
                relay_viewers.push(&frame.jpeg).await;
            }
            // Source closed: end every viewer's stream
            relay_viewers.viewers.write().await.clear();
        });

        cameras.insert(camera_id.to_string(), MultipartCamera { viewers, relay });
        tracing::debug!(camera_id = %camera_id, "Multipart publisher attached");
        Ok(true)
    }

    async fn detach(&self, camera_id: &str) -> bool {
        let removed = self.cameras.write().await.remove(camera_id);
        match removed {
            Some(camera) => {
                let closed = {
                    let mut viewers = camera.viewers.viewers.write().await;
                    let n = viewers.len();
                    viewers.clear();
                    n
                };
                tracing::info!(camera_id = %camera_id, closed_viewers = closed, "Multipart publisher detached");
                true
            }
            None => false,
        }
    }

    async fn stats(&self, camera_id: &str) -> Option<ViewerStats> {
        let viewers = self.cameras.read().await.get(camera_id)?.viewers.clone();
        let count = viewers.viewers.read().await.len();
        Some(ViewerStats {
            publisher: self.kind(),
            camera_id: camera_id.to_string(),
            viewers: count,
            frames_delivered: viewers.delivered.load(Ordering::Relaxed),
            frames_dropped: viewers.dropped.load(Ordering::Relaxed),
        })
    }
}
