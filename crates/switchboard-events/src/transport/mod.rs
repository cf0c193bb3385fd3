// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Transport adapters.
//!
//! Every adapter implements the same capability set over a closed protocol
//! variant: streaming socket, partitioned log, webhook. Health is a recency
//! check on the last successful send.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::event::AuditEvent;

pub mod log;
pub mod mock;
pub mod stream;
pub mod webhook;

/// Default send-recency window for health.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(300);

/// The closed set of delivery protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Stream,
    Log,
    Webhook,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Log => "log",
            Self::Webhook => "webhook",
        }
    }
}

/// Capability contract shared by every adapter.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Deliver one event to the given subscriptions. An error means at
    /// least one subscriber did not receive it; at-least-once redelivery
    /// may then duplicate to the ones that did.
    async fn send(&self, event: &AuditEvent, subscriber_ids: &[Uuid]) -> Result<()>;

    /// Deliver a batch, preserving per-aggregate order.
    async fn send_batch(&self, events: &[AuditEvent], subscriber_ids: &[Uuid]) -> Result<()>;

    fn protocol(&self) -> TransportProtocol;

    /// Healthy iff a send succeeded within the health window. A transport
    /// that has never sent reports healthy until its first delivery.
    fn is_healthy(&self) -> bool;

    async fn close(&self);
}

/// Millisecond-since-start recency tracking shared by the adapters.
#[derive(Debug)]
pub struct HealthTracker {
    started: Instant,
    /// 0 = never sent.
    last_success_ms: AtomicU64,
    timeout: Duration,
}

impl HealthTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_success_ms: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn note_success(&self) {
        let now_ms = u64::try_from(self.started.elapsed().as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        let last = self.last_success_ms.load(Ordering::Relaxed);
        if last == 0 {
            return true;
        }
        let now_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(now_ms.saturating_sub(last)) < self.timeout
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_labels() {
        assert_eq!(TransportProtocol::Stream.as_str(), "stream");
        assert_eq!(TransportProtocol::Log.as_str(), "log");
        assert_eq!(TransportProtocol::Webhook.as_str(), "webhook");
    }

    #[test]
    fn protocol_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TransportProtocol::Webhook).unwrap(),
            "\"webhook\""
        );
    }

    #[test]
    fn never_sent_is_healthy() {
        let tracker = HealthTracker::new(Duration::from_millis(50));
        assert!(tracker.is_healthy());
    }

    #[test]
    fn recent_success_is_healthy() {
        let tracker = HealthTracker::new(Duration::from_secs(60));
        tracker.note_success();
        assert!(tracker.is_healthy());
    }

    #[tokio::test]
    async fn stale_success_goes_unhealthy() {
        let tracker = HealthTracker::new(Duration::from_millis(20));
        tracker.note_success();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!tracker.is_healthy());
    }
}
