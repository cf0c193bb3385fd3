// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dead-letter queue for events that failed delivery.
//!
//! Bounded map keyed by event id. Repeated failures update the existing
//! entry in place; at capacity the entry with the oldest first-failure is
//! evicted. A background processor re-submits due entries through an
//! injected [`Redeliver`] sink on an exponential schedule, and a slower
//! cycle purges entries past retention.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::event::AuditEvent;

/// Re-submission sink. The publisher implements this over its ingress
/// queues; injecting the trait keeps the publisher/DLQ dependency one-way.
#[async_trait]
pub trait Redeliver: Send + Sync {
    async fn redeliver(&self, event: AuditEvent) -> Result<()>;
}

/// DLQ tuning.
#[derive(Debug, Clone, Copy)]
pub struct DlqConfig {
    /// Bounded entry count.
    pub max_size: usize,
    /// Give up after this many delivery attempts.
    pub max_attempts: u32,
    /// Base retry delay.
    pub retry_delay: Duration,
    /// Exponential factor per attempt.
    pub retry_backoff: f64,
    /// Entries older than this are purged.
    pub retention: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// One failed event awaiting retry or inspection.
#[derive(Debug, Clone, Serialize)]
pub struct FailedEvent {
    pub event: AuditEvent,
    pub reason: String,
    pub attempts: u32,
    pub first_fail: DateTime<Utc>,
    pub last_fail: DateTime<Utc>,
}

impl FailedEvent {
    /// When this entry becomes due for automatic retry.
    fn due_at(&self, config: &DlqConfig) -> DateTime<Utc> {
        let exponent = self.attempts.saturating_sub(1);
        let factor = config.retry_backoff.max(1.0).powi(exponent as i32);
        let delay_ms = (config.retry_delay.as_millis() as f64 * factor) as i64;
        self.last_fail + ChronoDuration::milliseconds(delay_ms)
    }
}

/// Bounded dead-letter queue.
pub struct DeadLetterQueue {
    config: DlqConfig,
    entries: RwLock<HashMap<Uuid, FailedEvent>>,
    added_total: AtomicU64,
    updated_total: AtomicU64,
    evicted_total: AtomicU64,
    retried_total: AtomicU64,
    recovered_total: AtomicU64,
    purged_total: AtomicU64,
}

/// Counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub size: usize,
    pub added_total: u64,
    pub updated_total: u64,
    pub evicted_total: u64,
    pub retried_total: u64,
    pub recovered_total: u64,
    pub purged_total: u64,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            added_total: AtomicU64::new(0),
            updated_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            retried_total: AtomicU64::new(0),
            recovered_total: AtomicU64::new(0),
            purged_total: AtomicU64::new(0),
        }
    }

    /// Record a delivery failure. Re-failing an event updates its entry in
    /// place; a new entry at capacity evicts the oldest first-failure.
    pub async fn add(&self, event: AuditEvent, reason: &str) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get_mut(&event.id) {
            existing.attempts += 1;
            existing.reason = reason.to_string();
            existing.last_fail = now;
            self.updated_total.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if entries.len() >= self.config.max_size {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.first_fail)
                .map(|(id, _)| *id)
            {
                entries.remove(&oldest);
                self.evicted_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(evicted = %oldest, "dead-letter queue full, evicted oldest entry");
            }
        }

        entries.insert(
            event.id,
            FailedEvent {
                event,
                reason: reason.to_string(),
                attempts: 1,
                first_fail: now,
                last_fail: now,
            },
        );
        self.added_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot up to `limit` entries, oldest first-failure first.
    pub async fn failed(&self, limit: usize) -> Vec<FailedEvent> {
        let entries = self.entries.read().await;
        let mut all: Vec<FailedEvent> = entries.values().cloned().collect();
        all.sort_by_key(|e| e.first_fail);
        all.truncate(limit);
        all
    }

    /// Manually retry one entry through the sink. Removes it on success;
    /// on failure the entry's attempt count grows.
    pub async fn retry(&self, event_id: Uuid, sink: &dyn Redeliver) -> Result<()> {
        let entry = {
            let entries = self.entries.read().await;
            entries
                .get(&event_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("dead-letter entry {event_id}")))?
        };

        self.retried_total.fetch_add(1, Ordering::Relaxed);
        match sink.redeliver(entry.event.clone()).await {
            Ok(()) => {
                self.entries.write().await.remove(&event_id);
                self.recovered_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let mut entries = self.entries.write().await;
                if let Some(existing) = entries.get_mut(&event_id) {
                    existing.attempts += 1;
                    existing.last_fail = Utc::now();
                    existing.reason = e.reason().to_string();
                }
                Err(e)
            }
        }
    }

    /// Remove one entry outright.
    pub async fn remove(&self, event_id: Uuid) -> bool {
        self.entries.write().await.remove(&event_id).is_some()
    }

    /// Re-submit every due entry below the attempt cap. Returns how many
    /// recovered.
    pub async fn process_due(&self, sink: &dyn Redeliver) -> usize {
        let now = Utc::now();
        let due: Vec<FailedEvent> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.attempts < self.config.max_attempts && e.due_at(&self.config) <= now)
                .cloned()
                .collect()
        };

        let mut recovered = 0;
        for entry in due {
            self.retried_total.fetch_add(1, Ordering::Relaxed);
            match sink.redeliver(entry.event.clone()).await {
                Ok(()) => {
                    self.entries.write().await.remove(&entry.event.id);
                    self.recovered_total.fetch_add(1, Ordering::Relaxed);
                    recovered += 1;
                }
                Err(e) => {
                    let mut entries = self.entries.write().await;
                    if let Some(existing) = entries.get_mut(&entry.event.id) {
                        existing.attempts += 1;
                        existing.last_fail = Utc::now();
                        existing.reason = e.reason().to_string();
                    }
                    tracing::debug!(
                        event_id = %entry.event.id,
                        error = %e,
                        "dead-letter redelivery failed"
                    );
                }
            }
        }
        recovered
    }

    /// Drop entries past retention. Returns how many were purged.
    pub async fn purge_expired(&self) -> usize {
        let retention =
            ChronoDuration::from_std(self.config.retention).unwrap_or(ChronoDuration::MAX);
        let cutoff = Utc::now() - retention;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.first_fail >= cutoff);
        let purged = before - entries.len();
        if purged > 0 {
            self.purged_total.fetch_add(purged as u64, Ordering::Relaxed);
            tracing::info!(purged, "purged expired dead-letter entries");
        }
        purged
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn stats_sync(&self) -> DlqStats {
        DlqStats {
            size: self
                .entries
                .try_read()
                .map(|e| e.len())
                .unwrap_or_default(),
            added_total: self.added_total.load(Ordering::Relaxed),
            updated_total: self.updated_total.load(Ordering::Relaxed),
            evicted_total: self.evicted_total.load(Ordering::Relaxed),
            retried_total: self.retried_total.load(Ordering::Relaxed),
            recovered_total: self.recovered_total.load(Ordering::Relaxed),
            purged_total: self.purged_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the retry and purge cycles.
    pub fn spawn_processor(
        self: &Arc<Self>,
        sink: Arc<dyn Redeliver>,
        retry_interval: Duration,
        purge_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let dlq = Arc::clone(self);
        tokio::spawn(async move {
            let mut retry = tokio::time::interval(retry_interval);
            retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut purge = tokio::time::interval(purge_interval);
            purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = retry.tick() => {
                        let recovered = dlq.process_due(sink.as_ref()).await;
                        if recovered > 0 {
                            tracing::info!(recovered, "dead-letter redelivery recovered events");
                        }
                    }
                    _ = purge.tick() => {
                        dlq.purge_expired().await;
                    }
                }
            }
        })
    }
}
