//! Binary socket publisher
//!
//! Frames go out as WebSocket binary messages with a 13-byte header (see
//! `wire`). Clients subscribe in one of two modes:
//!
//! - `raw_only`: every raw frame, never annotated ones
//! - `auto`: raw frames while detection is idle, annotated frames only while
//!   detection is active for the camera
//!
//! Detection counts as active for `detection_window` after the last annotated
//! frame. Slow inference would otherwise let a fresh raw frame overtake a
//! pending annotated one on screen.

use super::wire::{encode_frame, FrameType};
use super::{StreamPublisher, ViewerStats};
use crate::error::{Error, Result};
use crate::frame_distributor::{Frame, FrameDistributor};
use crate::pipeline::{AnnotatedFrame, AnnotatedFrameSink};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_DETECTION_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client subscription mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    Auto,
    RawOnly,
}

impl ClientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Auto => "auto",
            ClientMode::RawOnly => "raw_only",
        }
    }
}

/// Whether a raw frame reaches a client at `now`
pub fn should_deliver_raw(
    mode: ClientMode,
    last_annotated_at: Option<Instant>,
    now: Instant,
    window: Duration,
) -> bool {
    match mode {
        ClientMode::RawOnly => true,
        ClientMode::Auto => last_annotated_at
            .map(|at| now.saturating_duration_since(at) >= window)
            .unwrap_or(true),
    }
}

struct StreamClient {
    mode: ClientMode,
    tx: mpsc::Sender<Bytes>,
}

/// Per-camera socket state
struct CameraSockets {
    camera_id: String,
    clients: RwLock<HashMap<Uuid, StreamClient>>,
    last_annotated_at: RwLock<Option<Instant>>,
    /// Highest annotated sequence relayed, 0 when none
    last_annotated_seq: AtomicU64,
    raw_seq: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl CameraSockets {
    fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            clients: RwLock::new(HashMap::new()),
            last_annotated_at: RwLock::new(None),
            last_annotated_seq: AtomicU64::new(0),
            raw_seq: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a message to the clients selected by `wants`
    async fn send_where<F: Fn(ClientMode) -> bool>(&self, message: Bytes, wants: F) {
        let mut clients = self.clients.write().await;
        let mut gone = Vec::new();
        for (id, client) in clients.iter() {
            if !wants(client.mode) {
                continue;
            }
            match client.tx.try_send(message.clone()) {
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
            clients.remove(&id);
        }
    }

    async fn broadcast_raw(&self, frame: &Frame, window: Duration) {
        if frame.jpeg.is_empty() {
            return;
        }
        let sequence = self.raw_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let last_annotated = *self.last_annotated_at.read().await;
        let now = Instant::now();

        let message = encode_frame(FrameType::Raw, sequence, &frame.jpeg);
        self.send_where(message, |mode| {
            should_deliver_raw(mode, last_annotated, now, window)
        })
        .await;
    }

    async fn broadcast_annotated(&self, frame: &AnnotatedFrame) {
        if frame.jpeg.is_empty() {
            return;
        }
        let previous = self
            .last_annotated_seq
            .fetch_max(frame.sequence, Ordering::AcqRel);
        if previous >= frame.sequence {
            tracing::warn!(
                camera_id = %self.camera_id,
                sequence = frame.sequence,
                last_sequence = previous,
                "Stale annotated frame not relayed"
            );
            return;
        }
        *self.last_annotated_at.write().await = Some(Instant::now());

        let message = encode_frame(FrameType::Annotated, frame.sequence, &frame.jpeg);
        self.send_where(message, |mode| mode == ClientMode::Auto).await;
    }
}

struct SocketCamera {
    sockets: Arc<CameraSockets>,
    relay: JoinHandle<()>,
}

impl Drop for SocketCamera {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// A registered socket client, before it is bound to a WebSocket
pub struct SocketViewer {
    pub id: Uuid,
    pub camera_id: String,
    pub mode: ClientMode,
    rx: mpsc::Receiver<Bytes>,
}

impl SocketViewer {
    /// Next queued message (tests and non-WebSocket consumers)
    pub async fn next_message(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_next_message(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// BinarySocketPublisher instance
pub struct BinarySocketPublisher {
    distributor: Arc<FrameDistributor>,
    cameras: RwLock<HashMap<String, SocketCamera>>,
    queue_depth: usize,
    detection_window: Duration,
    write_timeout: Duration,
}

impl BinarySocketPublisher {
    pub fn new(distributor: Arc<FrameDistributor>, queue_depth: usize) -> Self {
        Self {
            distributor,
            cameras: RwLock::new(HashMap::new()),
            queue_depth: queue_depth.max(1),
            detection_window: DEFAULT_DETECTION_WINDOW,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_detection_window(mut self, window: Duration) -> Self {
        self.detection_window = window;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn detection_window(&self) -> Duration {
        self.detection_window
    }

    async fn sockets(&self, camera_id: &str) -> Option<Arc<CameraSockets>> {
        self.cameras
            .read()
            .await
            .get(camera_id)
            .map(|c| c.sockets.clone())
    }

    /// Register a client for an attached camera
    pub async fn connect(&self, camera_id: &str, mode: ClientMode) -> Result<SocketViewer> {
        let sockets = self
            .sockets(camera_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("stream for camera {}", camera_id)))?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let count = {
            let mut clients = sockets.clients.write().await;
            clients.insert(id, StreamClient { mode, tx });
            clients.len()
        };

        tracing::info!(
            camera_id = %camera_id,
            client_id = %id,
            mode = mode.as_str(),
            clients = count,
            "Socket client connected"
        );
        Ok(SocketViewer {
            id,
            camera_id: camera_id.to_string(),
            mode,
            rx,
        })
    }

    /// Remove a client. No-op when it is already gone.
    pub async fn disconnect(&self, camera_id: &str, client_id: &Uuid) {
        if let Some(sockets) = self.sockets(camera_id).await {
            let remaining = {
                let mut clients = sockets.clients.write().await;
                clients.remove(client_id).map(|_| clients.len())
            };
            if let Some(remaining) = remaining {
                tracing::info!(
                    camera_id = %camera_id,
                    client_id = %client_id,
                    remaining,
                    "Socket client disconnected"
                );
            }
        }
    }

    /// Drive one WebSocket until the client leaves, a write fails or misses
    /// its deadline, or the camera is detached
    pub async fn serve(self: Arc<Self>, socket: WebSocket, viewer: SocketViewer) {
        let (sender, mut receiver) = socket.split();
        let id = viewer.id;
        let camera_id = viewer.camera_id.clone();

        let writer = self.clone();
        let mut send_task = tokio::spawn(async move { writer.pump(viewer, sender).await });

        let mut recv_task = tokio::spawn(async move {
            while let Some(result) = receiver.next().await {
                match result {
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!(client_id = %id, error = %e, "Socket read error");
                        break;
                    }
                    _ => {}
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        self.disconnect(&camera_id, &id).await;
    }

    /// Write a viewer's queue into `sink`, then unregister the viewer
    pub async fn pump<S>(&self, viewer: SocketViewer, mut sink: S) -> WriteEnd
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let SocketViewer {
            id, camera_id, mut rx, ..
        } = viewer;

        let end = write_loop(&camera_id, id, &mut rx, &mut sink, self.write_timeout).await;
        let _ = tokio::time::timeout(self.write_timeout, sink.close()).await;
        self.disconnect(&camera_id, &id).await;
        end
    }
}

/// Why a socket writer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEnd {
    /// Queue closed: client removed or camera detached
    QueueClosed,
    WriteFailed,
    DeadlineExceeded,
}

async fn write_loop<S>(
    camera_id: &str,
    client_id: Uuid,
    rx: &mut mpsc::Receiver<Bytes>,
    sink: &mut S,
    write_timeout: Duration,
) -> WriteEnd
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        let (message, deadline) = tokio::select! {
            next = rx.recv() => match next {
                Some(bytes) => (Message::Binary(bytes.to_vec()), write_timeout),
                None => return WriteEnd::QueueClosed,
            },
            _ = ping.tick() => (Message::Ping(Vec::new()), PING_WRITE_TIMEOUT),
        };
        match tokio::time::timeout(deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(camera_id = %camera_id, client_id = %client_id, error = %e, "Socket write failed");
                return WriteEnd::WriteFailed;
            }
            Err(_) => {
                tracing::warn!(
                    camera_id = %camera_id,
                    client_id = %client_id,
                    timeout_ms = deadline.as_millis() as u64,
                    "Socket write deadline exceeded, disconnecting"
                );
                return WriteEnd::DeadlineExceeded;
            }
        }
    }
}

#[async_trait]
impl AnnotatedFrameSink for BinarySocketPublisher {
    async fn publish_annotated(&self, frame: Arc<AnnotatedFrame>) {
        if let Some(sockets) = self.sockets(&frame.camera_id).await {
            sockets.broadcast_annotated(&frame).await;
        }
    }
}

#[async_trait]
impl StreamPublisher for BinarySocketPublisher {
    fn kind(&self) -> &'static str {
        "binary_socket"
    }

    async fn attach(&self, camera_id: &str) -> Result<bool> {
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(camera_id) {
            return Ok(false);
        }

        let mut subscription = self.distributor.subscribe(camera_id, self.queue_depth).await?;
        let sockets = Arc::new(CameraSockets::new(camera_id));
        let relay_sockets = sockets.clone();
        let window = self.detection_window;
        let relay = tokio::spawn(async move {
            while let Some(frame) = subscription.recv().await {
                relay_sockets.broadcast_raw(&frame, window).await;
            }
            relay_sockets.clients.write().await.clear();
        });

        cameras.insert(camera_id.to_string(), SocketCamera { sockets, relay });
        tracing::debug!(camera_id = %camera_id, "Binary socket publisher attached");
        Ok(true)
    }

    async fn detach(&self, camera_id: &str) -> bool {
        let removed = self.cameras.write().await.remove(camera_id);
        match removed {
            Some(camera) => {
                let closed = {
                    let mut clients = camera.sockets.clients.write().await;
                    let n = clients.len();
                    clients.clear();
                    n
                };
                tracing::info!(camera_id = %camera_id, closed_clients = closed, "Binary socket publisher detached");
                true
            }
            None => false,
        }
    }

    async fn stats(&self, camera_id: &str) -> Option<ViewerStats> {
        let sockets = self.sockets(camera_id).await?;
        let viewers = sockets.clients.read().await.len();
        Some(ViewerStats {
            publisher: self.kind(),
            camera_id: camera_id.to_string(),
            viewers,
            frames_delivered: sockets.delivered.load(Ordering::Relaxed),
            frames_dropped: sockets.dropped.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_publisher::wire::decode_header;
    use chrono::Utc;

    fn secs(v: f64) -> Duration {
        Duration::from_secs_f64(v)
    }

    #[test]
    fn test_detection_window_scenario() {
        let base = Instant::now();
        let last = Some(base + secs(10.0));
        let window = secs(5.0);

        assert!(!should_deliver_raw(ClientMode::Auto, last, base + secs(14.9), window));
        assert!(should_deliver_raw(ClientMode::Auto, last, base + secs(15.1), window));
        assert!(should_deliver_raw(ClientMode::RawOnly, last, base + secs(14.9), window));
        assert!(should_deliver_raw(ClientMode::Auto, None, base, window));
    }

    async fn setup() -> (Arc<FrameDistributor>, BinarySocketPublisher) {
        let distributor = Arc::new(FrameDistributor::new());
        distributor.register_camera("cam1").await;
        let publisher = BinarySocketPublisher::new(distributor.clone(), 8);
        assert!(publisher.attach("cam1").await.unwrap());
        (distributor, publisher)
    }

    fn annotated(seq: u64) -> Arc<AnnotatedFrame> {
        Arc::new(AnnotatedFrame {
            camera_id: "cam1".to_string(),
            sequence: seq,
            captured_at: Utc::now(),
            jpeg: Bytes::from_static(b"ANNOTATED"),
            detection_count: 1,
        })
    }

    #[tokio::test]
    async fn test_raw_frames_get_own_sequence() {
        let (distributor, publisher) = setup().await;
        let mut viewer = publisher.connect("cam1", ClientMode::Auto).await.unwrap();

        distributor.publish(Frame::new("cam1", 40, Bytes::from_static(b"R1"))).await;
        distributor.publish(Frame::new("cam1", 41, Bytes::from_static(b"R2"))).await;

        let first = viewer.next_message().await.unwrap();
        let second = viewer.next_message().await.unwrap();
        let h1 = decode_header(&first).unwrap();
        let h2 = decode_header(&second).unwrap();
        assert_eq!(h1.kind, FrameType::Raw);
        assert_eq!((h1.sequence, h2.sequence), (1, 2));
        assert_eq!(h1.length, 2);
        assert_eq!(&first[13..], b"R1");
    }

    #[tokio::test]
    async fn test_annotated_only_to_auto_clients() {
        let (_d, publisher) = setup().await;
        let mut auto = publisher.connect("cam1", ClientMode::Auto).await.unwrap();
        let mut raw = publisher.connect("cam1", ClientMode::RawOnly).await.unwrap();

        publisher.publish_annotated(annotated(5)).await;

        let message = auto.next_message().await.unwrap();
        let header = decode_header(&message).unwrap();
        assert_eq!(header.kind, FrameType::Annotated);
        assert_eq!(header.sequence, 5);
        assert!(raw.try_next_message().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_suppressed_for_auto_while_detection_active() {
        let (distributor, publisher) = setup().await;
        let mut auto = publisher.connect("cam1", ClientMode::Auto).await.unwrap();
        let mut raw = publisher.connect("cam1", ClientMode::RawOnly).await.unwrap();

        publisher.publish_annotated(annotated(1)).await;
        assert!(auto.next_message().await.is_some());

        distributor.publish(Frame::new("cam1", 2, Bytes::from_static(b"R"))).await;
        let message = raw.next_message().await.unwrap();
        assert_eq!(decode_header(&message).unwrap().kind, FrameType::Raw);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(auto.try_next_message().is_none());

        // Window elapsed: auto viewers get raw frames again
        tokio::time::advance(DEFAULT_DETECTION_WINDOW).await;
        distributor.publish(Frame::new("cam1", 3, Bytes::from_static(b"R"))).await;
        let message = auto.next_message().await.unwrap();
        assert_eq!(decode_header(&message).unwrap().kind, FrameType::Raw);
    }

    #[tokio::test]
    async fn test_annotated_sequence_never_goes_back() {
        let (_d, publisher) = setup().await;
        let mut auto = publisher.connect("cam1", ClientMode::Auto).await.unwrap();

        for seq in [3, 5, 4, 5, 6] {
            publisher.publish_annotated(annotated(seq)).await;
        }

        let mut seen = Vec::new();
        while let Some(message) = auto.try_next_message() {
            seen.push(decode_header(&message).unwrap().sequence);
        }
        assert_eq!(seen, vec![3, 5, 6]);
    }

    #[tokio::test]
    async fn test_detach_closes_clients_and_is_idempotent() {
        let (_d, publisher) = setup().await;
        let mut viewer = publisher.connect("cam1", ClientMode::Auto).await.unwrap();

        assert!(publisher.detach("cam1").await);
        assert!(!publisher.detach("cam1").await);
        assert!(viewer.next_message().await.is_none());
        assert!(matches!(
            publisher.connect("cam1", ClientMode::Auto).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let (_d, publisher) = setup().await;
        let viewer = publisher.connect("cam1", ClientMode::RawOnly).await.unwrap();
        publisher.disconnect("cam1", &viewer.id).await;
        publisher.disconnect("cam1", &viewer.id).await;
        assert_eq!(publisher.stats("cam1").await.unwrap().viewers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_is_disconnected() {
        let (distributor, publisher) = setup().await;
        let viewer = publisher.connect("cam1", ClientMode::RawOnly).await.unwrap();
        for _ in 0..3 {
            distributor.publish_jpeg("cam1", Bytes::from_static(b"R")).await;
        }
        tokio::task::yield_now().await;

        // Bounded sink nobody reads: the first write never completes
        let (sink, _unread) = futures::channel::mpsc::channel::<Message>(0);
        let end = publisher.pump(viewer, sink).await;

        assert_eq!(end, WriteEnd::DeadlineExceeded);
        assert_eq!(publisher.stats("cam1").await.unwrap().viewers, 0);
    }

    #[tokio::test]
    async fn test_failed_write_disconnects() {
        let (_d, publisher) = setup().await;
        let viewer = publisher.connect("cam1", ClientMode::Auto).await.unwrap();
        publisher.publish_annotated(annotated(1)).await;

        let (sink, unread) = futures::channel::mpsc::unbounded::<Message>();
        drop(unread);
        assert_eq!(publisher.pump(viewer, sink).await, WriteEnd::WriteFailed);
        assert_eq!(publisher.stats("cam1").await.unwrap().viewers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_client_is_pinged_until_detach() {
        let (_d, publisher) = setup().await;
        let viewer = publisher.connect("cam1", ClientMode::Auto).await.unwrap();
        let (sink, mut out) = futures::channel::mpsc::unbounded::<Message>();

        let (end, ()) = tokio::join!(publisher.pump(viewer, sink), async {
            tokio::time::sleep(PING_INTERVAL + Duration::from_millis(1)).await;
            assert!(matches!(out.next().await, Some(Message::Ping(_))));
            assert!(publisher.detach("cam1").await);
        });

        assert_eq!(end, WriteEnd::QueueClosed);
    }
}
