// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-aggregate event sequencing and sliding-window deduplication.
//!
//! The ordering buffer holds out-of-order arrivals per aggregate and
//! releases them strictly in ascending sequence order. A gap older than the
//! configured timeout is released anyway so one lost event cannot stall an
//! aggregate's stream; the skip is logged with the missing range.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::event::AuditEvent;

struct AggregateState {
    next_seq: u64,
    pending: BTreeMap<u64, AuditEvent>,
    oldest_pending_at: Option<Instant>,
}

/// Buffers out-of-order events per aggregate.
pub struct OrderingBuffer {
    timeout: Duration,
    states: DashMap<String, AggregateState>,
    gap_releases: AtomicU64,
}

impl OrderingBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            states: DashMap::new(),
            gap_releases: AtomicU64::new(0),
        }
    }

    /// Offer an event; returns every event now releasable, in order.
    ///
    /// Sequence numbering starts at 1 per aggregate. Events arriving at or
    /// below the watermark (late duplicates of a gap release) pass through
    /// immediately.
    pub fn offer(&self, event: AuditEvent) -> Vec<AuditEvent> {
        let mut state = self
            .states
            .entry(event.aggregate_id.clone())
            .or_insert_with(|| AggregateState {
                next_seq: 1,
                pending: BTreeMap::new(),
                oldest_pending_at: None,
            });

        if event.sequence_num < state.next_seq {
            tracing::debug!(
                aggregate = %event.aggregate_id,
                sequence = event.sequence_num,
                watermark = state.next_seq,
                "late event below watermark, passing through"
            );
            return vec![event];
        }

        if event.sequence_num > state.next_seq {
            state.pending.insert(event.sequence_num, event);
            if state.oldest_pending_at.is_none() {
                state.oldest_pending_at = Some(Instant::now());
            }
            return Vec::new();
        }

        // In-order arrival: release it plus any now-consecutive pendings.
        let mut released = vec![event];
        state.next_seq += 1;
        loop {
            let seq = state.next_seq;
            match state.pending.remove(&seq) {
                Some(next) => {
                    released.push(next);
                    state.next_seq += 1;
                }
                None => break,
            }
        }
        state.oldest_pending_at = if state.pending.is_empty() {
            None
        } else {
            state.oldest_pending_at
        };
        released
    }

    /// Release pending events whose gap has outlived the timeout. Returns
    /// them in per-aggregate ascending order.
    pub fn flush_expired(&self) -> Vec<AuditEvent> {
        let mut released = Vec::new();
        for mut entry in self.states.iter_mut() {
            let aggregate = entry.key().clone();
            let state = entry.value_mut();
            let expired = state
                .oldest_pending_at
                .map(|at| at.elapsed() >= self.timeout)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            let first = state.pending.keys().next().copied().unwrap_or(0);
            tracing::warn!(
                aggregate = %aggregate,
                missing_from = state.next_seq,
                missing_to = first.saturating_sub(1),
                pending = state.pending.len(),
                "sequence gap outlived timeout, releasing buffered events"
            );
            self.gap_releases.fetch_add(1, AtomicOrdering::Relaxed);
            let pending = std::mem::take(&mut state.pending);
            for (seq, event) in pending {
                state.next_seq = seq + 1;
                released.push(event);
            }
            state.oldest_pending_at = None;
        }
        released
    }

    /// Events currently held back.
    pub fn pending_len(&self) -> usize {
        self.states.iter().map(|s| s.pending.len()).sum()
    }

    pub fn gap_releases(&self) -> u64 {
        self.gap_releases.load(AtomicOrdering::Relaxed)
    }
}

/// Sliding-window event-id deduplication. Duplicates inside the window are
/// dropped silently by the publisher.
pub struct Deduplicator {
    window: Duration,
    seen: DashMap<Uuid, Instant>,
    duplicates: AtomicU64,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record an id; returns false when it was already seen inside the
    /// window.
    pub fn check_and_record(&self, id: Uuid) -> bool {
        let now = Instant::now();
        match self.seen.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.window {
                    self.duplicates.fetch_add(1, AtomicOrdering::Relaxed);
                    false
                } else {
                    entry.insert(now);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.seen.len();
        let window = self.window;
        self.seen.retain(|_, first_seen| first_seen.elapsed() < window);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(AtomicOrdering::Relaxed)
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

    fn seqs(events: &[AuditEvent]) -> Vec<u64> {
        events.iter().map(|e| e.sequence_num).collect()
    }

    #[test]
    fn in_order_events_pass_straight_through() {
        let buffer = OrderingBuffer::new(Duration::from_secs(2));
        assert_eq!(seqs(&buffer.offer(event("a", 1))), vec![1]);
        assert_eq!(seqs(&buffer.offer(event("a", 2))), vec![2]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn out_of_order_arrivals_release_in_sequence() {
        // Scenario: publish [3, 1, 2], deliver [1, 2, 3].
        let buffer = OrderingBuffer::new(Duration::from_secs(2));
        assert!(buffer.offer(event("a", 3)).is_empty());
        assert_eq!(seqs(&buffer.offer(event("a", 1))), vec![1]);
        assert_eq!(seqs(&buffer.offer(event("a", 2))), vec![2, 3]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn aggregates_are_independent() {
        let buffer = OrderingBuffer::new(Duration::from_secs(2));
        assert!(buffer.offer(event("a", 2)).is_empty());
        // A different aggregate is not blocked by a's gap.
        assert_eq!(seqs(&buffer.offer(event("b", 1))), vec![1]);
    }

    #[test]
    fn late_event_below_watermark_passes_through() {
        let buffer = OrderingBuffer::new(Duration::from_secs(2));
        buffer.offer(event("a", 1));
        buffer.offer(event("a", 2));
        let released = buffer.offer(event("a", 1));
        assert_eq!(seqs(&released), vec![1]);
    }

    #[test]
    fn gap_flush_releases_pending_in_order() {
        let buffer = OrderingBuffer::new(Duration::ZERO);
        assert!(buffer.offer(event("a", 4)).is_empty());
        assert!(buffer.offer(event("a", 3)).is_empty());

        let released = buffer.flush_expired();
        assert_eq!(seqs(&released), vec![3, 4]);
        assert_eq!(buffer.gap_releases(), 1);

        // The watermark advanced past the released events.
        assert_eq!(seqs(&buffer.offer(event("a", 5))), vec![5]);
    }

    #[test]
    fn flush_is_a_noop_before_timeout() {
        let buffer = OrderingBuffer::new(Duration::from_secs(60));
        buffer.offer(event("a", 2));
        assert!(buffer.flush_expired().is_empty());
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn dedup_drops_repeat_ids_inside_window() {
        let dedup = Deduplicator::new(Duration::from_secs(60));
        let id = Uuid::new_v4();
        assert!(dedup.check_and_record(id));
        assert!(!dedup.check_and_record(id));
        assert!(!dedup.check_and_record(id));
        assert_eq!(dedup.duplicates(), 2);

        // A different id is unaffected.
        assert!(dedup.check_and_record(Uuid::new_v4()));
    }

    #[test]
    fn dedup_window_expiry_readmits() {
        let dedup = Deduplicator::new(Duration::ZERO);
        let id = Uuid::new_v4();
        assert!(dedup.check_and_record(id));
        // Zero window: the entry expires immediately.
        assert!(dedup.check_and_record(id));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let dedup = Deduplicator::new(Duration::ZERO);
        for _ in 0..10 {
            dedup.check_and_record(Uuid::new_v4());
        }
        assert_eq!(dedup.sweep(), 10);
        assert!(dedup.is_empty());
    }
}
