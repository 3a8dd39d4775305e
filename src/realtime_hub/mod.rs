//! RealtimeHub - Dashboard WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - Dashboard WebSocket connection management
//! - Detection notifications as the pipeline publishes events
//! - Camera activation status changes
//!
//! Note: only JSON notifications go through the hub. Video is served by the
//! stream publishers on their own endpoints.

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    Detection(DetectionMessage),
    CameraStatus(CameraStatusMessage),
}

impl HubMessage {
    fn kind(&self) -> &'static str {
        match self {
            HubMessage::Detection(_) => "detection",
            HubMessage::CameraStatus(_) => "camera_status",
        }
    }
}

/// Detection notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionMessage {
    /// Set when the detection was recorded as an event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
    pub camera_id: String,
    pub sequence: u64,
    pub primary_event: String,
    /// "high" / "medium" / "low"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat: Option<String>,
    pub detection_count: usize,
    pub face_count: usize,
    pub known_faces: usize,
    pub inference_ms: f32,
    pub timestamp: String,
}

/// Camera status message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStatusMessage {
    pub camera_id: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: String,
}

pub const DEFAULT_CLIENT_QUEUE_DEPTH: usize = 64;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
    dropped_messages: AtomicU64,
    queue_depth: usize,
    write_timeout: Duration,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            queue_depth: DEFAULT_CLIENT_QUEUE_DEPTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);

        self.connections
            .write()
            .await
            .insert(id, ClientConnection { id, tx });
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Dashboard client connected");
        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Dashboard client disconnected");
        }
    }

    /// Broadcast message to all clients
    ///
    /// Never waits on a client: a full queue loses this message for that
    /// client only, a closed one is pruned.
    pub async fn broadcast(&self, message: HubMessage) {
        let json = match serde_json::to_string(&message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hub message");
                return;
            }
        };

        let mut gone = Vec::new();
        {
            let connections = self.connections.read().await;
            tracing::debug!(
                message_type = message.kind(),
                client_count = connections.len(),
                "Broadcasting hub message"
            );

            for conn in connections.values() {
                match conn.tx.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(connection_id = %conn.id, "Dashboard client queue full, message dropped");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(conn.id),
                }
            }
        }

        for id in gone {
            self.unregister(&id).await;
        }
    }

    /// Write a client's queue into `sink` until the queue closes or a write
    /// fails or misses its deadline, then unregister the client
    pub async fn forward<S>(&self, id: Uuid, mut rx: mpsc::Receiver<String>, mut sink: S)
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        while let Some(json) = rx.recv().await {
            match tokio::time::timeout(self.write_timeout, sink.send(Message::Text(json))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(connection_id = %id, error = %e, "Dashboard write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        connection_id = %id,
                        timeout_ms = self.write_timeout.as_millis() as u64,
                        "Dashboard write deadline exceeded, disconnecting"
                    );
                    break;
                }
            }
        }
        let _ = tokio::time::timeout(self.write_timeout, sink.close()).await;
        self.unregister(&id).await;
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Messages lost to full client queues
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
