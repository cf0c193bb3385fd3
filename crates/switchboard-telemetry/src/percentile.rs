// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded-window percentile tracking.
//!
//! A sliding window of the most recent samples answered with nearest-rank
//! quantiles. Rank error is bounded by `1/len`, which is well inside the
//! accuracy the SLA scorer needs at the default window of 8192 samples.

use std::collections::VecDeque;
use std::time::Duration;

/// Minimum window capacity. Below this the quantile estimates are too noisy
/// to act on.
const MIN_CAPACITY: usize = 16;

/// Sliding window of latency samples with nearest-rank quantile queries.
///
/// Samples are stored as integer microseconds. The window holds the most
/// recent `capacity` samples; older samples fall off the front.
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    window: VecDeque<u64>,
    capacity: usize,
}

impl PercentileTracker {
    /// Create a tracker holding at most `capacity` samples (clamped to 16).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one latency sample.
    pub fn record(&mut self, duration: Duration) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window
            .push_back(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    /// Number of samples currently in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// True when no samples have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Nearest-rank quantile of the current window, `q` in `[0, 1]`.
    ///
    /// Returns `None` on an empty window. The returned duration is an actual
    /// observed sample, never an interpolation.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let q = q.clamp(0.0, 1.0);
        let n = sorted.len();
        // Nearest-rank: ceil(q * n), 1-based.
        let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
        Some(Duration::from_micros(sorted[rank - 1]))
    }

    /// Smallest sample in the window.
    pub fn min(&self) -> Option<Duration> {
        self.window.iter().min().map(|us| Duration::from_micros(*us))
    }

    /// Largest sample in the window.
    pub fn max(&self) -> Option<Duration> {
        self.window.iter().max().map(|us| Duration::from_micros(*us))
    }

    /// Arithmetic mean of the window.
    pub fn mean(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let sum: u128 = self.window.iter().map(|us| u128::from(*us)).sum();
        Some(Duration::from_micros(
            u64::try_from(sum / self.window.len() as u128).unwrap_or(u64::MAX),
        ))
    }

    /// Merge two windows into a combined tracker, e.g. cache-hit and
    /// cache-miss samples viewed together. The result's capacity is the sum
    /// of both inputs so no samples are lost in the merge.
    pub fn merge(&self, other: &PercentileTracker) -> PercentileTracker {
        let mut merged = PercentileTracker::new(self.capacity + other.capacity);
        for us in self.window.iter().chain(other.window.iter()) {
            merged.window.push_back(*us);
        }
        merged
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.window.clear();
    }
}
