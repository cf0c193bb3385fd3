// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Streaming-socket transport.
//!
//! Each subscription owns a bounded frame buffer. Sends apply a write
//! timeout so one wedged client cannot stall delivery; clients that stay
//! silent past twice the pong timeout are closed and their subscription id
//! is reported on the removal channel for the publisher to unsubscribe.
//! The socket pump itself lives in the axum adapter (`crate::ws`); this
//! module owns the connection registry and liveness policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::envelope::StreamFrame;
use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::transport::{EventTransport, HealthTracker, TransportProtocol, DEFAULT_HEALTH_TIMEOUT};

/// Streaming transport tuning.
#[derive(Debug, Clone, Copy)]
pub struct StreamTransportConfig {
    /// Per-connection outbound frame buffer.
    pub send_buffer_size: usize,
    /// Bound on pushing one frame into a connection buffer.
    pub write_timeout: Duration,
    /// Server ping cadence.
    pub ping_interval: Duration,
    /// Expected pong turnaround; connections silent for twice this are
    /// stale.
    pub pong_timeout: Duration,
    /// Send-recency window for health.
    pub health_timeout: Duration,
}

impl Default for StreamTransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: 256,
            write_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

struct Connection {
    frames: mpsc::Sender<StreamFrame>,
    last_pong_ms: AtomicU64,
    connected_at: Instant,
}

/// Fan-out over registered streaming connections.
pub struct StreamTransport {
    config: StreamTransportConfig,
    connections: DashMap<Uuid, Connection>,
    started: Instant,
    health: HealthTracker,
    slow_drops: AtomicU64,
    stale_closures: AtomicU64,
    /// Subscriptions whose connection went stale; the publisher drains
    /// this and unsubscribes them.
    removals_tx: mpsc::UnboundedSender<Uuid>,
    removals_rx: Mutex<Option<mpsc::UnboundedReceiver<Uuid>>>,
}

impl StreamTransport {
    pub fn new(config: StreamTransportConfig) -> Self {
        let (removals_tx, removals_rx) = mpsc::unbounded_channel();
        Self {
            health: HealthTracker::new(config.health_timeout),
            connections: DashMap::new(),
            started: Instant::now(),
            slow_drops: AtomicU64::new(0),
            stale_closures: AtomicU64::new(0),
            removals_tx,
            removals_rx: Mutex::new(Some(removals_rx)),
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Register a connection for a subscription; the returned receiver is
    /// the outbound frame stream the socket pump writes to the wire.
    pub fn register(&self, subscription_id: Uuid) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(self.config.send_buffer_size);
        self.connections.insert(
            subscription_id,
            Connection {
                frames: tx,
                last_pong_ms: AtomicU64::new(self.now_ms()),
                connected_at: Instant::now(),
            },
        );
        rx
    }

    /// Drop a connection (client disconnect or unsubscribe).
    pub fn deregister(&self, subscription_id: Uuid) -> bool {
        self.connections.remove(&subscription_id).is_some()
    }

    /// Record a pong (native or JSON) from the client.
    pub fn note_pong(&self, subscription_id: Uuid) {
        if let Some(conn) = self.connections.get(&subscription_id) {
            conn.last_pong_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn slow_drops(&self) -> u64 {
        self.slow_drops.load(Ordering::Relaxed)
    }

    pub fn stale_closures(&self) -> u64 {
        self.stale_closures.load(Ordering::Relaxed)
    }

    /// Take the removal stream. Single consumer; the publisher takes it at
    /// construction.
    pub fn take_removals(&self) -> Option<mpsc::UnboundedReceiver<Uuid>> {
        self.removals_rx.lock().take()
    }

    async fn push_frame(&self, subscription_id: Uuid, frame: StreamFrame) -> Result<()> {
        let tx = match self.connections.get(&subscription_id) {
            Some(conn) => conn.frames.clone(),
            None => {
                return Err(Error::NotFound(format!(
                    "stream connection {subscription_id}"
                )))
            }
        };
        match tokio::time::timeout(self.config.write_timeout, tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "stream connection {subscription_id} closed"
            ))),
            Err(_) => {
                self.slow_drops.fetch_add(1, Ordering::Relaxed);
                Err(Error::Timeout(format!(
                    "stream buffer full for {subscription_id} past {:?}",
                    self.config.write_timeout
                )))
            }
        }
    }

    async fn fan_out(&self, frame: &StreamFrame, subscriber_ids: &[Uuid]) -> Result<()> {
        let mut failures = 0usize;
        for id in subscriber_ids {
            if let Err(e) = self.push_frame(*id, frame.clone()).await {
                failures += 1;
                tracing::debug!(subscription = %id, error = %e, "stream delivery failed");
            }
        }
        if failures > 0 {
            return Err(Error::Transport(format!(
                "stream delivery failed for {failures}/{} subscribers",
                subscriber_ids.len()
            )));
        }
        self.health.note_success();
        Ok(())
    }

    /// Close connections whose last pong is older than twice the pong
    /// timeout. Their subscription ids land on the removal channel.
    pub fn sweep_stale(&self) -> usize {
        let stale_after = self.config.pong_timeout * 2;
        let now_ms = self.now_ms();
        let stale: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|entry| {
                let last = entry.last_pong_ms.load(Ordering::Relaxed);
                Duration::from_millis(now_ms.saturating_sub(last)) > stale_after
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            self.connections.remove(id);
            self.stale_closures.fetch_add(1, Ordering::Relaxed);
            tracing::info!(subscription = %id, "closing stale stream connection");
            let _ = self.removals_tx.send(*id);
        }
        stale.len()
    }

    /// Broadcast pings and sweep stale connections on the ping interval.
    pub fn spawn_liveness_task(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(transport.config.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        let ids: Vec<Uuid> =
                            transport.connections.iter().map(|e| *e.key()).collect();
                        for id in ids {
                            // Best effort; a full buffer is the stale
                            // sweeper's problem, not the ping's.
                            if let Some(conn) = transport.connections.get(&id) {
                                let _ = conn.frames.try_send(StreamFrame::Ping);
                            }
                        }
                        transport.sweep_stale();
                    }
                }
            }
        })
    }

    /// Connection age, for diagnostics.
    pub fn connection_age(&self, subscription_id: Uuid) -> Option<Duration> {
        self.connections
            .get(&subscription_id)
            .map(|c| c.connected_at.elapsed())
    }
}

#[async_trait]
impl EventTransport for StreamTransport {
    async fn send(&self, event: &AuditEvent, subscriber_ids: &[Uuid]) -> Result<()> {
        self.fan_out(&StreamFrame::event(event), subscriber_ids).await
    }

    async fn send_batch(&self, events: &[AuditEvent], subscriber_ids: &[Uuid]) -> Result<()> {
        // Coalesce into one frame per subscriber wake.
        self.fan_out(&StreamFrame::batch(events), subscriber_ids).await
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Stream
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    async fn close(&self) {
        self.connections.clear();
    }
}
