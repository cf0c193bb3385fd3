// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Performance degradation detection against a warm-up baseline.
//!
//! The detector captures p50/p95/p99 over the first `min_samples`
//! measurements and afterwards compares the live p99 against that baseline.
//! Trend direction comes from a least-squares fit over the recent window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::percentile::PercentileTracker;

/// Detector tuning.
#[derive(Debug, Clone, Copy)]
pub struct DegradationConfig {
    /// Recent measurements kept for trend estimation.
    pub window: usize,
    /// Degradation declared when current p99 >= baseline p99 * threshold.
    pub threshold: f64,
    /// Warm-up samples required before a baseline is frozen.
    pub min_samples: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            window: 256,
            threshold: 2.0,
            min_samples: 100,
        }
    }
}

/// Baseline percentiles captured at the end of warm-up.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Baseline {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Assessment of the current window against the baseline.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationReport {
    pub degraded: bool,
    /// current p99 / baseline p99.
    pub factor: f64,
    /// Confidence in the verdict, grows with sample count, capped at 0.99.
    pub confidence: f64,
    /// Least-squares slope over the recent window, in microseconds per
    /// sample. Positive means latency is climbing.
    pub trend_slope_us_per_sample: f64,
    pub baseline: Baseline,
    pub current_p99_us: u64,
}

/// Tracks warm-up, baseline, and the recent measurement window.
#[derive(Debug)]
pub struct DegradationDetector {
    config: DegradationConfig,
    warmup: PercentileTracker,
    baseline: Option<Baseline>,
    recent: VecDeque<u64>,
    samples_seen: u64,
}

impl DegradationDetector {
    pub fn new(config: DegradationConfig) -> Self {
        let warmup_capacity = config.min_samples.max(16);
        Self {
            config,
            warmup: PercentileTracker::new(warmup_capacity),
            baseline: None,
            recent: VecDeque::with_capacity(config.window.max(16)),
            samples_seen: 0,
        }
    }

    /// Feed one measurement. Freezes the baseline once warm-up completes.
    pub fn ingest(&mut self, duration: Duration) {
        self.samples_seen += 1;
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        if self.baseline.is_none() {
            self.warmup.record(duration);
            if self.warmup.len() >= self.config.min_samples {
                self.baseline = Some(Baseline {
                    p50_us: quantile_us(&self.warmup, 0.50),
                    p95_us: quantile_us(&self.warmup, 0.95),
                    p99_us: quantile_us(&self.warmup, 0.99),
                });
            }
        }

        if self.recent.len() == self.config.window.max(16) {
            self.recent.pop_front();
        }
        self.recent.push_back(us);
    }

    /// Baseline, if warm-up has completed.
    pub fn baseline(&self) -> Option<Baseline> {
        self.baseline
    }

    /// Compare the given current p99 against the baseline.
    ///
    /// Returns `None` until the baseline exists.
    pub fn assess(&self, current_p99: Duration) -> Option<DegradationReport> {
        let baseline = self.baseline?;
        let current_p99_us = u64::try_from(current_p99.as_micros()).unwrap_or(u64::MAX);
        let factor = if baseline.p99_us == 0 {
            if current_p99_us == 0 {
                1.0
            } else {
                f64::INFINITY
            }
        } else {
            current_p99_us as f64 / baseline.p99_us as f64
        };

        // Confidence grows with evidence beyond warm-up.
        let extra = self.samples_seen.saturating_sub(self.config.min_samples as u64);
        let confidence = (0.5 + (extra as f64 / (extra as f64 + 200.0)) * 0.5).min(0.99);

        Some(DegradationReport {
            degraded: factor >= self.config.threshold,
            factor,
            confidence,
            trend_slope_us_per_sample: self.trend_slope(),
            baseline,
            current_p99_us,
        })
    }

    /// Least-squares slope over the full recent window (us per sample index).
    pub fn trend_slope(&self) -> f64 {
        self.trend_slope_over(self.recent.len())
    }

    /// Least-squares slope over the last `n` recent samples.
    pub fn trend_slope_over(&self, n: usize) -> f64 {
        let n = n.min(self.recent.len());
        if n < 2 {
            return 0.0;
        }
        let start = self.recent.len() - n;
        let n_f = n as f64;
        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_x2 = 0.0;
        for (i, us) in self.recent.iter().skip(start).enumerate() {
            let x = i as f64;
            let y = *us as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_x2 += x * x;
        }
        let denom = n_f * sum_x2 - sum_x * sum_x;
        if denom.abs() < f64::EPSILON {
            return 0.0;
        }
        (n_f * sum_xy - sum_x * sum_y) / denom
    }
}

fn quantile_us(tracker: &PercentileTracker, q: f64) -> u64 {
    tracker
        .quantile(q)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn detector(min_samples: usize, threshold: f64) -> DegradationDetector {
        DegradationDetector::new(DegradationConfig {
            window: 64,
            threshold,
            min_samples,
        })
    }

    #[test]
    fn no_assessment_before_warmup() {
        let mut d = detector(50, 2.0);
        for _ in 0..49 {
            d.ingest(Duration::from_micros(100));
        }
        assert!(d.baseline().is_none());
        assert!(d.assess(Duration::from_micros(100)).is_none());
    }

    #[test]
    fn baseline_freezes_after_warmup() {
        let mut d = detector(50, 2.0);
        for _ in 0..50 {
            d.ingest(Duration::from_micros(100));
        }
        let baseline = d.baseline().unwrap();
        assert_eq!(baseline.p99_us, 100);

        // Later slow samples must not move the frozen baseline.
        for _ in 0..50 {
            d.ingest(Duration::from_micros(10_000));
        }
        assert_eq!(d.baseline().unwrap().p99_us, 100);
    }

    #[test]
    fn detects_degradation_past_threshold_factor() {
        let mut d = detector(50, 2.0);
        for _ in 0..50 {
            d.ingest(Duration::from_micros(100));
        }
        let ok = d.assess(Duration::from_micros(150)).unwrap();
        assert!(!ok.degraded);
        assert!((ok.factor - 1.5).abs() < 1e-9);

        let bad = d.assess(Duration::from_micros(250)).unwrap();
        assert!(bad.degraded);
        assert!((bad.factor - 2.5).abs() < 1e-9);
    }

    #[test]
    fn confidence_grows_with_samples() {
        let mut d = detector(50, 2.0);
        for _ in 0..50 {
            d.ingest(Duration::from_micros(100));
        }
        let early = d.assess(Duration::from_micros(100)).unwrap().confidence;
        for _ in 0..1000 {
            d.ingest(Duration::from_micros(100));
        }
        let late = d.assess(Duration::from_micros(100)).unwrap().confidence;
        assert!(late > early);
        assert!(late <= 0.99);
    }

    #[test]
    fn trend_slope_rises_on_climbing_latency() {
        let mut d = detector(16, 2.0);
        for i in 0..64u64 {
            d.ingest(Duration::from_micros(100 + i * 10));
        }
        assert!(d.trend_slope() > 0.0);
    }

    #[test]
    fn trend_slope_flat_on_constant_latency() {
        let mut d = detector(16, 2.0);
        for _ in 0..64 {
            d.ingest(Duration::from_micros(100));
        }
        assert!(d.trend_slope().abs() < 1e-9);
    }
}
