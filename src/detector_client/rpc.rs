//! Long-lived bidirectional RPC session
//!
//! One session per detector client. A send task drains the outbound queue
//! onto the wire, a receive task routes replies back to the caller. Replies
//! are correlated by single flight: one in-flight call per client, enforced
//! by holding the session guard from send until reply or timeout.
//!
//! Any send/receive error tears the stream down; the next call re-establishes
//! it. A cached health check short-circuits calls to a known-unhealthy service.

use super::types::HealthStatus;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Replies coming back from the service
pub type InboundStream<T> = BoxStream<'static, Result<T>>;

/// Transport under a streaming session (gRPC in production, fakes in tests)
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Open a bidirectional stream whose requests are read from `outbound`
    async fn open_stream(
        &self,
        outbound: mpsc::Receiver<Self::Request>,
    ) -> Result<InboundStream<Self::Response>>;

    async fn health_check(&self) -> Result<HealthStatus>;
}

/// Session timing and queue settings
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub send_timeout: Duration,
    pub response_timeout: Duration,
    pub health_ttl: Duration,
    pub health_timeout: Duration,
    pub queue_depth: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(100),
            response_timeout: Duration::from_millis(500),
            health_ttl: Duration::from_secs(30),
            health_timeout: Duration::from_secs(1),
            queue_depth: 10,
        }
    }
}

struct HealthCache {
    ttl: Duration,
    entry: RwLock<Option<(HealthStatus, Instant)>>,
}

impl HealthCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    async fn fresh(&self) -> Option<HealthStatus> {
        let entry = self.entry.read().await;
        match entry.as_ref() {
            Some((status, at)) if at.elapsed() < self.ttl => Some(status.clone()),
            _ => None,
        }
    }

    async fn last(&self) -> Option<HealthStatus> {
        self.entry.read().await.as_ref().map(|(s, _)| s.clone())
    }

    async fn store(&self, status: HealthStatus) {
        *self.entry.write().await = Some((status, Instant::now()));
    }

    async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}

struct ActiveStream<Req, Resp> {
    generation: u64,
    outbound: mpsc::Sender<Req>,
    inbound: mpsc::Receiver<Resp>,
    alive: Arc<AtomicBool>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl<Req, Resp> ActiveStream<Req, Resp> {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }
}

impl<Req, Resp> Drop for ActiveStream<Req, Resp> {
    fn drop(&mut self) {
        self.send_task.abort();
        self.recv_task.abort();
    }
}

#[derive(Default)]
struct RpcCounters {
    calls: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    short_circuited: AtomicU64,
    reconnects: AtomicU64,
    stale_replies: AtomicU64,
}

/// Session statistics
#[derive(Debug, Clone, Serialize)]
pub struct RpcStats {
    pub service: String,
    pub connected: bool,
    pub stream_generation: u64,
    pub healthy: Option<bool>,
    pub calls: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub short_circuited: u64,
    pub reconnects: u64,
    pub stale_replies: u64,
}

/// Why an exchange on an open stream did not produce a reply
enum ExchangeFailure {
    Timeout(String),
    StreamLost(String),
}

/// Streaming RPC session
pub struct StreamingRpc<T: StreamTransport> {
    service: &'static str,
    transport: T,
    settings: RpcSettings,
    /// One in-flight call per client; the guard doubles as the correlation lock
    session: Mutex<Option<ActiveStream<T::Request, T::Response>>>,
    health: HealthCache,
    counters: RpcCounters,
    generation: AtomicU64,
}

impl<T: StreamTransport> StreamingRpc<T> {
    pub fn new(service: &'static str, transport: T, settings: RpcSettings) -> Self {
        let health = HealthCache::new(settings.health_ttl);
        Self {
            service,
            transport,
            settings,
            session: Mutex::new(None),
            health,
            counters: RpcCounters::default(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }

    /// Cached health, refreshed when older than the TTL
    pub async fn health(&self) -> HealthStatus {
        match self.health.fresh().await {
            Some(status) => status,
            None => self.refresh_health().await,
        }
    }

    /// Query the service and replace the cached health
    pub async fn refresh_health(&self) -> HealthStatus {
        let status = match tokio::time::timeout(
            self.settings.health_timeout,
            self.transport.health_check(),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => HealthStatus::unreachable(e.to_string()),
            Err(_) => HealthStatus::unreachable(format!(
                "health check timed out after {}ms",
                self.settings.health_timeout.as_millis()
            )),
        };

        if status.is_healthy() {
            tracing::debug!(service = self.service, device = %status.device, "Detector healthy");
        } else {
            tracing::warn!(
                service = self.service,
                status = %status.status,
                model_loaded = status.model_loaded,
                error = ?status.error,
                "Detector unhealthy"
            );
        }

        self.health.store(status.clone()).await;
        status
    }

    /// Send one request and wait for its reply
    ///
    /// `is_reply` rejects replies left over from an earlier call that timed out.
    pub async fn call<F>(
        &self,
        request: T::Request,
        timeout: Option<Duration>,
        is_reply: F,
    ) -> Result<T::Response>
    where
        F: Fn(&T::Response) -> bool + Send,
    {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let health = self.health().await;
        if !health.is_healthy() {
            self.counters.short_circuited.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ServiceUnavailable(format!(
                "{} is {}",
                self.service, health.status
            )));
        }

        // One deadline covers waiting for the session, the send and the reply
        let timeout = timeout.unwrap_or(self.settings.response_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut session = match tokio::time::timeout_at(deadline, self.session.lock()).await {
            Ok(session) => session,
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(Error::Timeout(format!(
                    "{} busy, no session within {}ms",
                    self.service,
                    timeout.as_millis()
                )));
            }
        };

        let needs_stream = session.as_ref().map(|s| !s.is_alive()).unwrap_or(true);
        if needs_stream {
            // Dropping a dead stream aborts its tasks
            *session = None;
            match self.establish().await {
                Ok(stream) => *session = Some(stream),
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    // Force a fresh health check on the next call
                    self.health.invalidate().await;
                    tracing::warn!(service = self.service, error = %e, "Failed to establish detector stream");
                    return Err(Error::ServiceUnavailable(format!(
                        "{} stream unavailable: {}",
                        self.service, e
                    )));
                }
            }
        }

        let active = session
            .as_mut()
            .ok_or_else(|| Error::Internal(format!("{} stream missing", self.service)))?;

        match self.exchange(active, request, deadline, is_reply).await {
            Ok(reply) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(reply)
            }
            Err(ExchangeFailure::Timeout(msg)) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::Timeout(msg))
            }
            Err(ExchangeFailure::StreamLost(msg)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let generation = active.generation;
                *session = None;
                tracing::warn!(
                    service = self.service,
                    generation,
                    reason = %msg,
                    "Detector stream torn down"
                );
                Err(Error::ServiceUnavailable(msg))
            }
        }
    }

    async fn exchange<F>(
        &self,
        active: &mut ActiveStream<T::Request, T::Response>,
        request: T::Request,
        deadline: tokio::time::Instant,
        is_reply: F,
    ) -> std::result::Result<T::Response, ExchangeFailure>
    where
        F: Fn(&T::Response) -> bool + Send,
    {
        while active.inbound.try_recv().is_ok() {
            self.counters.stale_replies.fetch_add(1, Ordering::Relaxed);
        }

        let send_deadline = deadline.min(tokio::time::Instant::now() + self.settings.send_timeout);
        match tokio::time::timeout_at(send_deadline, active.outbound.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(ExchangeFailure::StreamLost(format!(
                    "{} stream closed while sending",
                    self.service
                )))
            }
            Err(_) => {
                return Err(ExchangeFailure::Timeout(format!(
                    "{} send timed out",
                    self.service
                )))
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, active.inbound.recv()).await {
                Ok(Some(reply)) if is_reply(&reply) => return Ok(reply),
                Ok(Some(_)) => {
                    self.counters.stale_replies.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(service = self.service, "Discarded stale reply");
                }
                Ok(None) => {
                    return Err(ExchangeFailure::StreamLost(format!(
                        "{} stream closed while waiting for reply",
                        self.service
                    )))
                }
                Err(_) => {
                    return Err(ExchangeFailure::Timeout(format!(
                        "{} reply timed out",
                        self.service
                    )))
                }
            }
        }
    }

    async fn establish(&self) -> Result<ActiveStream<T::Request, T::Response>> {
        let depth = self.settings.queue_depth.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (wire_tx, wire_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(depth);

        let inbound = self.transport.open_stream(wire_rx).await?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        if generation > 1 {
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        let alive = Arc::new(AtomicBool::new(true));

        let send_task = tokio::spawn(send_loop(
            self.service,
            generation,
            outbound_rx,
            wire_tx,
            alive.clone(),
        ));
        let recv_task = tokio::spawn(recv_loop(
            self.service,
            generation,
            inbound,
            reply_tx,
            alive.clone(),
        ));

        tracing::info!(service = self.service, generation, "Detector stream established");

        Ok(ActiveStream {
            generation,
            outbound: outbound_tx,
            inbound: reply_rx,
            alive,
            send_task,
            recv_task,
        })
    }

    /// Tear down the current stream, if any
    pub async fn reset(&self) {
        if self.session.lock().await.take().is_some() {
            tracing::info!(service = self.service, "Detector stream reset");
        }
    }

    pub async fn stats(&self) -> RpcStats {
        let connected = match self.session.try_lock() {
            Ok(session) => session.as_ref().map(|s| s.is_alive()).unwrap_or(false),
            // A call is in flight, so a stream exists
            Err(_) => true,
        };
        RpcStats {
            service: self.service.to_string(),
            connected,
            stream_generation: self.generation.load(Ordering::Relaxed),
            healthy: self.health.last().await.map(|h| h.is_healthy()),
            calls: self.counters.calls.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            short_circuited: self.counters.short_circuited.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            stale_replies: self.counters.stale_replies.load(Ordering::Relaxed),
        }
    }
}

async fn send_loop<Req: Send>(
    service: &'static str,
    generation: u64,
    mut outbound: mpsc::Receiver<Req>,
    wire: mpsc::Sender<Req>,
    alive: Arc<AtomicBool>,
) {
    while let Some(request) = outbound.recv().await {
        if wire.send(request).await.is_err() {
            tracing::warn!(service, generation, "Stream send failed");
            break;
        }
    }
    alive.store(false, Ordering::Release);
    tracing::debug!(service, generation, "Send task stopped");
}

async fn recv_loop<Resp: Send>(
    service: &'static str,
    generation: u64,
    mut inbound: InboundStream<Resp>,
    replies: mpsc::Sender<Resp>,
    alive: Arc<AtomicBool>,
) {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(reply) => match replies.try_send(reply) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(service, generation, "Reply queue full, reply dropped");
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(e) => {
                tracing::warn!(service, generation, error = %e, "Stream receive failed");
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
    tracing::debug!(service, generation, "Receive task stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    /// Request: (id, reply delay ms). The fake echoes the id back.
    pub(crate) type EchoRequest = (u64, u64);

    #[derive(Default)]
    pub(crate) struct EchoState {
        pub unhealthy: AtomicBool,
        pub refuse_open: AtomicBool,
        /// Close the stream instead of replying to this id
        pub break_on: AtomicU64,
        pub opens: AtomicUsize,
        pub health_checks: AtomicUsize,
    }

    #[derive(Clone, Default)]
    pub(crate) struct EchoTransport {
        pub state: Arc<EchoState>,
    }

    #[async_trait]
    impl StreamTransport for EchoTransport {
        type Request = EchoRequest;
        type Response = u64;

        async fn open_stream(
            &self,
            mut outbound: mpsc::Receiver<EchoRequest>,
        ) -> Result<InboundStream<u64>> {
            if self.state.refuse_open.load(Ordering::SeqCst) {
                return Err(Error::ServiceUnavailable("connection refused".into()));
            }
            self.state.opens.fetch_add(1, Ordering::SeqCst);

            let state = self.state.clone();
            let (tx, rx) = mpsc::channel::<Result<u64>>(16);
            tokio::spawn(async move {
                while let Some((id, delay_ms)) = outbound.recv().await {
                    if state.break_on.load(Ordering::SeqCst) == id {
                        let _ = tx.send(Err(Error::ServiceUnavailable("reset".into()))).await;
                        return;
                    }
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = tx.send(Ok(id)).await;
                    });
                }
            });

            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed())
        }

        async fn health_check(&self) -> Result<HealthStatus> {
            self.state.health_checks.fetch_add(1, Ordering::SeqCst);
            let healthy = !self.state.unhealthy.load(Ordering::SeqCst);
            Ok(HealthStatus {
                status: if healthy { "healthy" } else { "degraded" }.to_string(),
                model_loaded: healthy,
                device: "cpu".to_string(),
                checked_at: Utc::now(),
                error: None,
            })
        }
    }

    fn settings() -> RpcSettings {
        RpcSettings {
            response_timeout: Duration::from_millis(100),
            ..RpcSettings::default()
        }
    }

    fn rpc(transport: EchoTransport) -> StreamingRpc<EchoTransport> {
        StreamingRpc::new("echo", transport, settings())
    }

    async fn call(rpc: &StreamingRpc<EchoTransport>, id: u64, delay_ms: u64) -> Result<u64> {
        rpc.call((id, delay_ms), None, move |reply| *reply == id).await
    }

    #[tokio::test]
    async fn test_call_round_trip_reuses_stream() {
        let transport = EchoTransport::default();
        let rpc = rpc(transport.clone());

        assert_eq!(call(&rpc, 1, 0).await.unwrap(), 1);
        assert_eq!(call(&rpc, 2, 0).await.unwrap(), 2);
        assert_eq!(transport.state.opens.load(Ordering::SeqCst), 1);
        assert_eq!(transport.state.health_checks.load(Ordering::SeqCst), 1);

        let stats = rpc.stats().await;
        assert_eq!(stats.completed, 2);
        assert!(stats.connected);
    }

    #[tokio::test]
    async fn test_unhealthy_service_short_circuits() {
        let transport = EchoTransport::default();
        transport.state.unhealthy.store(true, Ordering::SeqCst);
        let rpc = rpc(transport.clone());

        for id in 1..=3 {
            let err = call(&rpc, id, 0).await.unwrap_err();
            assert!(matches!(err, Error::ServiceUnavailable(_)));
        }
        // Cached: one health check, no stream attempts
        assert_eq!(transport.state.health_checks.load(Ordering::SeqCst), 1);
        assert_eq!(transport.state.opens.load(Ordering::SeqCst), 0);
        assert_eq!(rpc.stats().await.short_circuited, 3);
    }

    #[tokio::test]
    async fn test_establish_failure_fails_fast_then_recovers() {
        let transport = EchoTransport::default();
        transport.state.refuse_open.store(true, Ordering::SeqCst);
        let rpc = rpc(transport.clone());

        let err = call(&rpc, 1, 0).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));

        transport.state.refuse_open.store(false, Ordering::SeqCst);
        assert_eq!(call(&rpc, 2, 0).await.unwrap(), 2);
        assert_eq!(transport.state.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_error_tears_down_and_next_call_reconnects() {
        let transport = EchoTransport::default();
        transport.state.break_on.store(2, Ordering::SeqCst);
        let rpc = rpc(transport.clone());

        assert_eq!(call(&rpc, 1, 0).await.unwrap(), 1);
        let err = call(&rpc, 2, 0).await.unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));

        assert_eq!(call(&rpc, 3, 0).await.unwrap(), 3);
        assert_eq!(transport.state.opens.load(Ordering::SeqCst), 2);
        assert_eq!(rpc.stats().await.reconnects, 1);
    }

    #[tokio::test]
    async fn test_timeout_then_stale_reply_is_discarded() {
        let transport = EchoTransport::default();
        let rpc = rpc(transport.clone());

        let err = call(&rpc, 1, 150).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Reply for id 1 arrives while id 2 is in flight
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(call(&rpc, 2, 60).await.unwrap(), 2);
        assert_eq!(rpc.stats().await.stale_replies, 1);
        assert_eq!(transport.state.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let transport = EchoTransport::default();
        let rpc = Arc::new(rpc(transport));

        let handles: Vec<_> = (1..=4)
            .map(|id| {
                let rpc = rpc.clone();
                tokio::spawn(async move { call(&rpc, id, 5).await })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_queued_callers_share_one_timeout_budget() {
        let transport = EchoTransport::default();
        let rpc = Arc::new(rpc(transport));
        // Warm the health cache and the stream
        assert_eq!(call(&rpc, 1, 0).await.unwrap(), 1);

        let handles: Vec<_> = (10..15)
            .map(|id| {
                let rpc = rpc.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = call(&rpc, id, 10_000).await;
                    (result, started.elapsed())
                })
            })
            .collect();

        let mut worst = Duration::ZERO;
        for handle in handles {
            let (result, elapsed) = handle.await.unwrap();
            assert!(matches!(result, Err(Error::Timeout(_))));
            worst = worst.max(elapsed);
        }
        // 100ms response timeout; serialized waits would take ~500ms
        assert!(worst < Duration::from_millis(250), "worst latency {:?}", worst);
        assert_eq!(rpc.stats().await.timeouts, 5);
    }
}
