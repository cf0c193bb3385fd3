// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process transport double for unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::transport::{EventTransport, TransportProtocol};

/// One recorded delivery.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub sequence_num: u64,
    pub subscriber_ids: Vec<Uuid>,
    pub batched: bool,
}

/// Records everything it is asked to send. Failure mode and artificial
/// latency are toggleable at runtime.
pub struct MockTransport {
    protocol: TransportProtocol,
    pub sends: Mutex<Vec<RecordedSend>>,
    fail: AtomicBool,
    delay_ms: AtomicU64,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(protocol: TransportProtocol) -> Self {
        Self {
            protocol,
            sends: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::Relaxed);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Recorded deliveries, in arrival order.
    pub fn recorded(&self) -> Vec<RecordedSend> {
        self.sends.lock().clone()
    }

    /// Delivered sequence numbers for one aggregate, in arrival order.
    pub fn sequences_for(&self, aggregate_id: &str) -> Vec<u64> {
        self.sends
            .lock()
            .iter()
            .filter(|s| s.aggregate_id == aggregate_id)
            .map(|s| s.sequence_num)
            .collect()
    }

    async fn deliver(&self, event: &AuditEvent, subscriber_ids: &[Uuid], batched: bool) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::Transport("mock transport failing".to_string()));
        }
        self.sends.lock().push(RecordedSend {
            event_id: event.id,
            aggregate_id: event.aggregate_id.clone(),
            sequence_num: event.sequence_num,
            subscriber_ids: subscriber_ids.to_vec(),
            batched,
        });
        Ok(())
    }
}

#[async_trait]
impl EventTransport for MockTransport {
    async fn send(&self, event: &AuditEvent, subscriber_ids: &[Uuid]) -> Result<()> {
        self.deliver(event, subscriber_ids, false).await
    }

    async fn send_batch(&self, events: &[AuditEvent], subscriber_ids: &[Uuid]) -> Result<()> {
        for event in events {
            self.deliver(event, subscriber_ids, true).await?;
        }
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Severity};

    fn event(aggregate: &str, seq: u64) -> AuditEvent {
        AuditEvent::new(
            EventType::CallCreated,
            Severity::Info,
            "call",
            aggregate,
            "create",
            "success",
        )
        .with_sequence(seq)
    }

    #[tokio::test]
    async fn records_sends_and_batches() {
        let mock = MockTransport::new(TransportProtocol::Stream);
        let sub = Uuid::new_v4();
        mock.send(&event("a", 1), &[sub]).await.unwrap();
        mock.send_batch(&[event("a", 2), event("a", 3)], &[sub])
            .await
            .unwrap();

        let recorded = mock.recorded();
        assert_eq!(recorded.len(), 3);
        assert!(!recorded[0].batched);
        assert!(recorded[1].batched);
        assert_eq!(mock.sequences_for("a"), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failure_mode_rejects() {
        let mock = MockTransport::new(TransportProtocol::Webhook);
        mock.set_failing(true);
        let err = mock.send(&event("a", 1), &[]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(mock.recorded().is_empty());
    }

    #[tokio::test]
    async fn close_marks_closed() {
        let mock = MockTransport::new(TransportProtocol::Log);
        assert!(!mock.is_closed());
        mock.close().await;
        assert!(mock.is_closed());
    }
}
