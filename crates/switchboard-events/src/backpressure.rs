// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Backpressure admission control and the circuit breaker guarding the
//! publish path.
//!
//! The controller enforces a hard bound on combined queue depth. An
//! admission that finds the depth at the bound sleeps once, up to
//! `backpressure_delay`, and fails if the depth has not recovered. Repeated
//! admission failures open the breaker; after `reset_timeout` a bounded
//! number of half-open probes decide whether to close it again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::errors::{Error, Result};

/// Controller tuning, lifted from the publisher config.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_queue_depth: usize,
    pub backpressure_delay: Duration,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_limit: u32,
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Controller metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureStats {
    pub state: CircuitState,
    pub depth: usize,
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub rejected_requests: u64,
    pub circuit_opens: u64,
    pub avg_wait_us: u64,
}

/// Capacity of the recent-waits sample ring.
const RECENT_WAITS: usize = 64;

/// Process-wide admission controller for the publish path.
pub struct BackpressureController {
    config: BackpressureConfig,
    depth: AtomicUsize,
    breaker: Mutex<BreakerInner>,
    total: AtomicU64,
    throttled: AtomicU64,
    rejected: AtomicU64,
    circuit_opens: AtomicU64,
    recent_waits: Mutex<VecDeque<Duration>>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            depth: AtomicUsize::new(0),
            breaker: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            total: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
            recent_waits: Mutex::new(VecDeque::with_capacity(RECENT_WAITS)),
        }
    }

    /// Admit one publish. Never blocks longer than `backpressure_delay`.
    ///
    /// A successful admission counts as a breaker success; if the
    /// subsequent enqueue still fails, the caller reports it with
    /// [`record_failure`](Self::record_failure).
    pub async fn admit(&self) -> Result<()> {
        self.total.fetch_add(1, Ordering::Relaxed);

        // Breaker gate.
        {
            let mut breaker = self.breaker.lock();
            match breaker.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let elapsed = breaker
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= self.config.reset_timeout {
                        breaker.state = CircuitState::HalfOpen;
                        breaker.half_open_in_flight = 1;
                        tracing::info!("circuit breaker half-open, probing");
                    } else {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::CircuitOpen);
                    }
                }
                CircuitState::HalfOpen => {
                    if breaker.half_open_in_flight >= self.config.half_open_limit {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::CircuitOpen);
                    }
                    breaker.half_open_in_flight += 1;
                }
            }
        }

        // Depth gate: one bounded wait, then fail.
        if self.depth.load(Ordering::Relaxed) >= self.config.max_queue_depth {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            let waited = Instant::now();
            tokio::time::sleep(self.config.backpressure_delay).await;
            self.note_wait(waited.elapsed());

            if self.depth.load(Ordering::Relaxed) >= self.config.max_queue_depth {
                self.record_failure();
                return Err(Error::QueueFull(format!(
                    "depth {} at bound {} after {:?} backpressure delay",
                    self.depth.load(Ordering::Relaxed),
                    self.config.max_queue_depth,
                    self.config.backpressure_delay
                )));
            }
        }

        self.record_success();
        Ok(())
    }

    /// Report a post-admission failure (enqueue raced full).
    pub fn record_failure(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.half_open_in_flight = 0;
                self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("half-open probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                    self.circuit_opens.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        failures = breaker.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Report a successful admission. One half-open success closes the
    /// breaker.
    pub fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Closed;
                breaker.consecutive_failures = 0;
                breaker.opened_at = None;
                breaker.half_open_in_flight = 0;
                tracing::info!("half-open probe succeeded, circuit closed");
            }
            CircuitState::Closed => {
                breaker.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Track an enqueue into a bounded queue.
    pub fn note_enqueued(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Track a dequeue.
    pub fn note_dequeued(&self) {
        // Saturating: shutdown drains can race the gauge to zero.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.lock().state
    }

    fn note_wait(&self, wait: Duration) {
        let mut waits = self.recent_waits.lock();
        if waits.len() == RECENT_WAITS {
            waits.pop_front();
        }
        waits.push_back(wait);
    }

    pub fn stats(&self) -> BackpressureStats {
        let avg_wait_us = {
            let waits = self.recent_waits.lock();
            if waits.is_empty() {
                0
            } else {
                let sum: u128 = waits.iter().map(|w| w.as_micros()).sum();
                u64::try_from(sum / waits.len() as u128).unwrap_or(u64::MAX)
            }
        };
        BackpressureStats {
            state: self.state(),
            depth: self.depth(),
            total_requests: self.total.load(Ordering::Relaxed),
            throttled_requests: self.throttled.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            avg_wait_us,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_depth: usize, failure_threshold: u32) -> BackpressureController {
        BackpressureController::new(BackpressureConfig {
            max_queue_depth: max_depth,
            backpressure_delay: Duration::from_millis(10),
            failure_threshold,
            reset_timeout: Duration::from_millis(100),
            half_open_limit: 2,
        })
    }

    #[tokio::test]
    async fn admits_below_bound() {
        let c = controller(2, 3);
        assert!(c.admit().await.is_ok());
        c.note_enqueued();
        assert!(c.admit().await.is_ok());
        assert_eq!(c.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn full_depth_waits_then_fails() {
        let c = controller(1, 3);
        c.note_enqueued();
        let err = c.admit().await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        let stats = c.stats();
        assert_eq!(stats.throttled_requests, 1);
        assert!(stats.avg_wait_us > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_recovery_during_delay_admits() {
        let c = std::sync::Arc::new(controller(1, 3));
        c.note_enqueued();
        let c2 = std::sync::Arc::clone(&c);
        let admit = tokio::spawn(async move { c2.admit().await });
        // Drain while the admission sleeps.
        tokio::time::sleep(Duration::from_millis(5)).await;
        c.note_dequeued();
        assert!(admit.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_threshold_consecutive_failures() {
        let c = controller(1, 3);
        c.note_enqueued();
        for _ in 0..2 {
            let _ = c.admit().await;
        }
        assert_eq!(c.state(), CircuitState::Closed);
        let _ = c.admit().await;
        assert_eq!(c.state(), CircuitState::Open);
        assert_eq!(c.stats().circuit_opens, 1);

        // While open, admissions reject without waiting.
        let err = c.admit().await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen));
        assert!(c.stats().rejected_requests >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let c = controller(1, 3);
        c.note_enqueued();
        let _ = c.admit().await; // failure 1
        let _ = c.admit().await; // failure 2
        c.note_dequeued();
        assert!(c.admit().await.is_ok()); // success resets the streak
        c.note_enqueued();
        let _ = c.admit().await; // failure 1 again
        let _ = c.admit().await; // failure 2
        assert_eq!(c.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_transitions_half_open_then_closed() {
        let c = controller(1, 1);
        c.note_enqueued();
        let _ = c.admit().await;
        assert_eq!(c.state(), CircuitState::Open);

        // Before the reset timeout: still rejecting.
        assert!(matches!(c.admit().await.unwrap_err(), Error::CircuitOpen));

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Probe passes because the queue drained.
        c.note_dequeued();
        assert!(c.admit().await.is_ok());
        assert_eq!(c.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let c = controller(1, 1);
        c.note_enqueued();
        let _ = c.admit().await;
        assert_eq!(c.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Queue still full: the probe fails and the circuit re-opens.
        let err = c.admit().await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        assert_eq!(c.state(), CircuitState::Open);
        assert_eq!(c.stats().circuit_opens, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limit_bounds_probes() {
        let c = std::sync::Arc::new(controller(1000, 1));
        // Force open with a post-admission failure.
        c.record_failure();
        assert_eq!(c.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(150)).await;

        // First admit flips to half-open and consumes one probe slot.
        // Hold the state by reporting neither success nor failure: emulate
        // by checking the in-flight cap with direct records.
        {
            let mut breaker = c.breaker.lock();
            breaker.state = CircuitState::HalfOpen;
            breaker.half_open_in_flight = 2; // at the limit
        }
        let err = c.admit().await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen));
    }

    #[test]
    fn dequeue_never_underflows() {
        let c = controller(4, 3);
        c.note_dequeued();
        assert_eq!(c.depth(), 0);
        c.note_enqueued();
        c.note_dequeued();
        c.note_dequeued();
        assert_eq!(c.depth(), 0);
    }
}
