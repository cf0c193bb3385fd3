// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Publisher configuration.
//!
//! Every knob is a typed field with a production default. `validate()`
//! clamps tunables into workable ranges with a warning; only structurally
//! impossible values fail construction.

use std::time::Duration;

use crate::errors::{Error, Result};
use crate::router::RouterConfig;

/// Event publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Normal ingress queue bound.
    pub event_queue_size: usize,
    /// Critical ingress queue bound.
    pub critical_queue_size: usize,
    /// Workers on the normal queue.
    pub worker_count: usize,
    /// Workers on the critical queue.
    pub critical_workers: usize,
    /// Whether the micro-batching worker runs alongside the normal workers.
    pub batch_worker_enabled: bool,
    /// Flush a batch at this many events.
    pub batch_size: usize,
    /// Or after this long, whichever comes first.
    pub batch_timeout: Duration,
    /// Dead-letter retry attempts per event.
    pub max_retries: u32,
    /// Base dead-letter retry delay.
    pub retry_delay: Duration,
    /// Exponential factor on the retry delay.
    pub retry_backoff: f64,
    /// Hard bound on combined queue depth before backpressure engages.
    pub max_queue_depth: usize,
    /// How long `publish` may stall waiting for depth to recover.
    pub backpressure_delay: Duration,
    /// Consecutive admission failures before the circuit opens.
    pub failure_threshold: u32,
    /// Open-state dwell before a half-open probe.
    pub reset_timeout: Duration,
    /// Concurrent half-open admissions.
    pub half_open_limit: u32,
    /// Per-transport-call timeout.
    pub send_timeout: Duration,
    /// Upper bound on drain at close.
    pub shutdown_timeout: Duration,
    /// Per-aggregate sequencing of out-of-order arrivals.
    pub ordering_enabled: bool,
    /// Gap tolerance before releasing out-of-order events anyway.
    pub ordering_timeout: Duration,
    /// Event-id deduplication.
    pub dedup_enabled: bool,
    /// Sliding dedup window.
    pub dedup_window: Duration,
    /// Dead-letter queue capacity.
    pub dlq_max_size: usize,
    /// Dead-letter retry processor cadence.
    pub dlq_retry_interval: Duration,
    /// Dead-letter entry retention.
    pub dlq_retention: Duration,
    /// Dead-letter purge cadence.
    pub dlq_purge_interval: Duration,
    /// Router and decision-cache tuning.
    pub router: RouterConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            event_queue_size: 10_000,
            critical_queue_size: 1_000,
            worker_count: 4,
            critical_workers: 2,
            batch_worker_enabled: true,
            batch_size: 50,
            batch_timeout: Duration::from_millis(100),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            max_queue_depth: 8_000,
            backpressure_delay: Duration::from_millis(50),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(10),
            half_open_limit: 3,
            send_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            ordering_enabled: true,
            ordering_timeout: Duration::from_secs(2),
            dedup_enabled: true,
            dedup_window: Duration::from_secs(300),
            dlq_max_size: 10_000,
            dlq_retry_interval: Duration::from_secs(30),
            dlq_retention: Duration::from_secs(24 * 3600),
            dlq_purge_interval: Duration::from_secs(600),
            router: RouterConfig::default(),
        }
    }
}

impl PublisherConfig {
    pub fn validate(mut self) -> Result<Self> {
        if self.event_queue_size == 0 || self.critical_queue_size == 0 {
            return Err(Error::Validation(
                "queue sizes must be > 0".to_string(),
            ));
        }
        if self.worker_count == 0 && self.critical_workers == 0 && !self.batch_worker_enabled {
            return Err(Error::Validation(
                "at least one worker or the batch worker must be enabled".to_string(),
            ));
        }
        if self.batch_size == 0 {
            tracing::warn!("batch_size of zero; using 1");
            self.batch_size = 1;
        }
        if self.batch_timeout.is_zero() {
            tracing::warn!("batch_timeout of zero; using 100ms");
            self.batch_timeout = Duration::from_millis(100);
        }
        if self.max_queue_depth == 0 {
            tracing::warn!(
                fallback = self.event_queue_size,
                "max_queue_depth of zero; using event_queue_size"
            );
            self.max_queue_depth = self.event_queue_size;
        }
        if self.failure_threshold == 0 {
            tracing::warn!("failure_threshold of zero; using 1");
            self.failure_threshold = 1;
        }
        if self.half_open_limit == 0 {
            tracing::warn!("half_open_limit of zero; using 1");
            self.half_open_limit = 1;
        }
        if self.retry_backoff < 1.0 {
            tracing::warn!(
                provided = self.retry_backoff,
                "retry_backoff below 1.0; using 1.0"
            );
            self.retry_backoff = 1.0;
        }
        if self.send_timeout.is_zero() {
            tracing::warn!("send_timeout of zero; using 5s");
            self.send_timeout = Duration::from_secs(5);
        }
        if self.dlq_max_size == 0 {
            tracing::warn!("dlq_max_size of zero; using 1");
            self.dlq_max_size = 1;
        }
        Ok(self)
    }

    /// Load from `SWITCHBOARD_*` environment variables, defaults for the
    /// rest.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            event_queue_size: env_usize("SWITCHBOARD_EVENT_QUEUE_SIZE", defaults.event_queue_size),
            critical_queue_size: env_usize(
                "SWITCHBOARD_CRITICAL_QUEUE_SIZE",
                defaults.critical_queue_size,
            ),
            worker_count: env_usize("SWITCHBOARD_WORKER_COUNT", defaults.worker_count),
            critical_workers: env_usize(
                "SWITCHBOARD_CRITICAL_WORKERS",
                defaults.critical_workers,
            ),
            batch_size: env_usize("SWITCHBOARD_BATCH_SIZE", defaults.batch_size),
            batch_timeout: env_millis("SWITCHBOARD_BATCH_TIMEOUT_MS", defaults.batch_timeout),
            max_queue_depth: env_usize("SWITCHBOARD_MAX_QUEUE_DEPTH", defaults.max_queue_depth),
            backpressure_delay: env_millis(
                "SWITCHBOARD_BACKPRESSURE_DELAY_MS",
                defaults.backpressure_delay,
            ),
            failure_threshold: env_u32(
                "SWITCHBOARD_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            ),
            reset_timeout: env_millis("SWITCHBOARD_RESET_TIMEOUT_MS", defaults.reset_timeout),
            send_timeout: env_millis("SWITCHBOARD_SEND_TIMEOUT_MS", defaults.send_timeout),
            shutdown_timeout: env_millis(
                "SWITCHBOARD_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            ),
            ..defaults
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %v, "unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %v, "unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .unwrap_or_else(|_| {
                tracing::warn!(var = name, value = %v, "unparsable value, using default");
                default
            }),
        Err(_) => default,
    }
}
