//! FrameDistributor - Single-capture Multi-consumer Fan-out
//!
//! ## Responsibilities
//!
//! - Single point of frame ingestion per camera
//! - Fan each frame out to every subscriber without re-capturing
//! - Drop-on-full delivery so a slow subscriber never blocks capture
//! - Per-camera capture statistics
//!
//! The distributor knows nothing about detection or streaming. Frames are
//! shared as `Arc<Frame>`; subscribers only ever see an immutable reference.

use crate::error::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

/// Default subscriber queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 5;

/// One JPEG-encoded camera image
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    /// Strictly increasing per camera
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub jpeg: Bytes,
}

impl Frame {
    pub fn new(camera_id: impl Into<String>, sequence: u64, jpeg: Bytes) -> Self {
        Self {
            camera_id: camera_id.into(),
            sequence,
            captured_at: Utc::now(),
            jpeg,
        }
    }
}

/// Result of a single publish call
///
/// Publishing never fails towards the caller; problems are reported here and
/// counted in [`CaptureStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Frame was offered to every subscriber
    Delivered { delivered: usize, dropped: usize },
    /// Camera is not registered
    UnknownCamera,
    /// Sequence was not greater than the last published one
    OutOfOrder { last_sequence: u64 },
}

/// Capture statistics for a camera
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    pub camera_id: String,
    pub frames_published: u64,
    pub frames_dropped: u64,
    pub frames_out_of_order: u64,
    pub last_sequence: u64,
    pub subscriber_count: usize,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// Read side of a camera subscription
///
/// Owned by the consumer. `recv` returns `None` once the subscription was
/// unsubscribed or the camera was torn down.
pub struct Subscription {
    id: u64,
    camera_id: String,
    rx: mpsc::Receiver<Arc<Frame>>,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wait for the next frame
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        if self.closed {
            return None;
        }
        let frame = self.rx.recv().await;
        if frame.is_none() {
            self.closed = true;
        }
        frame
    }

    /// Non-blocking receive, used by tests and drain loops
    pub fn try_recv(&mut self) -> Option<Arc<Frame>> {
        if self.closed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("camera_id", &self.camera_id)
            .field("closed", &self.closed)
            .finish()
    }
}

struct Subscriber {
    tx: mpsc::Sender<Arc<Frame>>,
    dropped: u64,
}

enum Incoming {
    /// Sequence chosen by the source, must exceed the last one
    Sequenced(Frame),
    /// Next sequence is stamped at delivery
    Unsequenced(Bytes),
}

/// Per-camera fan-out entry
struct CameraFeed {
    camera_id: String,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    last_sequence: AtomicU64,
    frames_published: AtomicU64,
    frames_dropped: AtomicU64,
    frames_out_of_order: AtomicU64,
    /// Unix millis of the last published frame, 0 when none
    last_frame_ms: AtomicI64,
}

impl CameraFeed {
    fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            subscribers: RwLock::new(HashMap::new()),
            last_sequence: AtomicU64::new(0),
            frames_published: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_out_of_order: AtomicU64::new(0),
            last_frame_ms: AtomicI64::new(0),
        }
    }

    /// Check or stamp the sequence and fan out under the subscriber lock, so
    /// concurrent publishers are delivered in sequence order
    async fn deliver(&self, incoming: Incoming) -> PublishOutcome {
        let mut subscribers = self.subscribers.write().await;
        let last_sequence = self.last_sequence.load(Ordering::Acquire);

        let frame = match incoming {
            Incoming::Sequenced(frame) if frame.sequence <= last_sequence => {
                drop(subscribers);
                self.frames_out_of_order.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    camera_id = %self.camera_id,
                    sequence = frame.sequence,
                    last_sequence,
                    "Out-of-order frame rejected"
                );
                return PublishOutcome::OutOfOrder { last_sequence };
            }
            Incoming::Sequenced(frame) => frame,
            Incoming::Unsequenced(jpeg) => Frame::new(&self.camera_id, last_sequence + 1, jpeg),
        };

        self.last_sequence.store(frame.sequence, Ordering::Release);
        self.last_frame_ms
            .store(frame.captured_at.timestamp_millis(), Ordering::Relaxed);
        self.frames_published.fetch_add(1, Ordering::Relaxed);

        let frame = Arc::new(frame);
        let mut delivered = 0;
        let mut dropped = 0;
        let mut gone = Vec::new();

        for (id, sub) in subscribers.iter_mut() {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in &gone {
            subscribers.remove(id);
        }
        drop(subscribers);

        if dropped > 0 {
            self.frames_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::trace!(
                camera_id = %self.camera_id,
                sequence = frame.sequence,
                dropped,
                "Subscriber queue full, frame dropped"
            );
        }
        for id in gone {
            tracing::debug!(camera_id = %self.camera_id, subscription_id = id, "Removed dropped subscription");
        }

        PublishOutcome::Delivered { delivered, dropped }
    }

    async fn stats(&self) -> CaptureStats {
        let last_ms = self.last_frame_ms.load(Ordering::Relaxed);
        CaptureStats {
            camera_id: self.camera_id.clone(),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_out_of_order: self.frames_out_of_order.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            subscriber_count: self.subscribers.read().await.len(),
            last_frame_at: if last_ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_ms).single()
            },
        }
    }
}

/// FrameDistributor instance
pub struct FrameDistributor {
    cameras: RwLock<HashMap<String, Arc<CameraFeed>>>,
    next_subscription_id: AtomicU64,
}

impl FrameDistributor {
    /// Create new FrameDistributor
    pub fn new() -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    /// Register a camera. Returns false if it was already registered.
    pub async fn register_camera(&self, camera_id: &str) -> bool {
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(camera_id) {
            return false;
        }
        cameras.insert(camera_id.to_string(), Arc::new(CameraFeed::new(camera_id)));
        tracing::info!(camera_id = %camera_id, "Camera registered with frame distributor");
        true
    }

    /// Tear down a camera entry and close all its subscriptions
    ///
    /// Subscribers drain whatever is already queued and then observe the end
    /// of the stream. Calling this twice is a no-op.
    pub async fn deactivate_camera(&self, camera_id: &str) -> bool {
        let feed = {
            let mut cameras = self.cameras.write().await;
            cameras.remove(camera_id)
        };

        match feed {
            Some(feed) => {
                let closed = {
                    let mut subscribers = feed.subscribers.write().await;
                    let n = subscribers.len();
                    subscribers.clear();
                    n
                };
                tracing::info!(
                    camera_id = %camera_id,
                    closed_subscriptions = closed,
                    "Camera removed from frame distributor"
                );
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, camera_id: &str) -> bool {
        self.cameras.read().await.contains_key(camera_id)
    }

    pub async fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn feed(&self, camera_id: &str) -> Option<Arc<CameraFeed>> {
        self.cameras.read().await.get(camera_id).cloned()
    }

    /// Subscribe to a camera's frames with a bounded queue
    pub async fn subscribe(&self, camera_id: &str, queue_depth: usize) -> Result<Subscription> {
        let feed = self
            .feed(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        feed.subscribers
            .write()
            .await
            .insert(id, Subscriber { tx, dropped: 0 });

        tracing::debug!(
            camera_id = %camera_id,
            subscription_id = id,
            queue_depth,
            "Subscription created"
        );

        Ok(Subscription {
            id,
            camera_id: camera_id.to_string(),
            rx,
            closed: false,
        })
    }

    /// Close a subscription. No-op when already closed.
    pub async fn unsubscribe(&self, subscription: &mut Subscription) {
        if subscription.closed {
            return;
        }
        subscription.closed = true;
        subscription.rx.close();

        if let Some(feed) = self.feed(&subscription.camera_id).await {
            if let Some(sub) = feed.subscribers.write().await.remove(&subscription.id) {
                tracing::debug!(
                    camera_id = %subscription.camera_id,
                    subscription_id = subscription.id,
                    dropped = sub.dropped,
                    "Subscription closed"
                );
            }
        }
    }

    /// Publish a frame produced by a capture source
    ///
    /// Never blocks on subscribers: a full queue drops the frame for that
    /// subscriber only.
    pub async fn publish(&self, frame: Frame) -> PublishOutcome {
        let Some(feed) = self.feed(&frame.camera_id).await else {
            tracing::warn!(camera_id = %frame.camera_id, sequence = frame.sequence, "Frame for unregistered camera");
            return PublishOutcome::UnknownCamera;
        };

        feed.deliver(Incoming::Sequenced(frame)).await
    }

    /// Stamp the next sequence number for a camera and publish the JPEG
    pub async fn publish_jpeg(&self, camera_id: &str, jpeg: Bytes) -> PublishOutcome {
        let Some(feed) = self.feed(camera_id).await else {
            tracing::warn!(camera_id = %camera_id, "Frame for unregistered camera");
            return PublishOutcome::UnknownCamera;
        };
        feed.deliver(Incoming::Unsequenced(jpeg)).await
    }

    /// Capture statistics for a camera
    pub async fn stats(&self, camera_id: &str) -> Result<CaptureStats> {
        let feed = self
            .feed(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;
        Ok(feed.stats().await)
    }
}

impl Default for FrameDistributor {
    fn default() -> Self {
        Self::new()
    }
}
