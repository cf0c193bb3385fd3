// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The tiered query accelerator.
//!
//! Decision chain per lookup: canonicalize → L1 → negative filter → L2 →
//! reserve pooled resources for the database path. The L1 probe runs before
//! the negative filter so a cached listed-number result can never be masked
//! by a filter false positive. Every query's latency lands in the shared
//! [`LatencyMonitor`] with its cache-hit flag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use switchboard_telemetry::LatencyMonitor;

use crate::bloom::NegativeFilter;
use crate::config::DncConfig;
use crate::conn_pool::{ConnectionFactory, ConnectionPool, PooledConnection};
use crate::errors::{Error, Result};
use crate::l1_cache::QueryCache;
use crate::l2::RemoteCache;
use crate::worker_pool::{WorkerLease, WorkerPool};
use crate::DncResult;

/// The operation label queries are recorded under in the latency monitor.
const QUERY_OPERATION: &str = "dnc_query";

/// How a query was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStrategy {
    /// Negative filter short-circuit: number is confirmed absent.
    Skip,
    /// Served from the in-process cache.
    L1Hit,
    /// Served from the remote cache and promoted into L1.
    L2Hit,
    /// All tiers missed; caller must run the database query.
    RequiresDb,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::L1Hit => "l1_hit",
            Self::L2Hit => "l2_hit",
            Self::RequiresDb => "requires_db",
        }
    }
}

/// Outcome of [`QueryAccelerator::optimize_query`]. On the database path it
/// carries the reserved connection (and a worker lease when one was free).
#[derive(Debug)]
pub struct QueryOptimization<C: crate::conn_pool::PooledResource> {
    pub phone_number: String,
    pub strategy: CacheStrategy,
    pub result: Option<DncResult>,
    pub requires_db_query: bool,
    pub connection: Option<PooledConnection<C>>,
    pub worker: Option<WorkerLease>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorStats {
    pub skips: u64,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub db_queries: u64,
    pub invalid_numbers: u64,
    pub l2_errors: u64,
}

#[derive(Default)]
struct Counters {
    skips: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    db_queries: AtomicU64,
    invalid_numbers: AtomicU64,
    l2_errors: AtomicU64,
}

/// Canonicalize a phone number to E.164-ish form.
///
/// Accepts digits with common formatting (spaces, dashes, dots, parens) and
/// an optional leading `+`. Bare 10-digit numbers are treated as NANP.
pub fn canonicalize_number(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidNumber("empty".to_string()));
    }
    let mut saw_plus = false;
    let mut digits = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '+' if i == 0 => saw_plus = true,
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            other => {
                return Err(Error::InvalidNumber(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    if saw_plus {
        if !(8..=15).contains(&digits.len()) {
            return Err(Error::InvalidNumber(format!(
                "{} digits outside E.164 range",
                digits.len()
            )));
        }
        Ok(format!("+{digits}"))
    } else if digits.len() == 10 {
        Ok(format!("+1{digits}"))
    } else if digits.len() == 11 && digits.starts_with('1') {
        Ok(format!("+{digits}"))
    } else {
        Err(Error::InvalidNumber(format!(
            "cannot infer country code for {} digits",
            digits.len()
        )))
    }
}

/// Tiered DNC query accelerator.
pub struct QueryAccelerator<F: ConnectionFactory> {
    config: DncConfig,
    l1: Arc<QueryCache>,
    bloom: Option<NegativeFilter>,
    l2: Option<Arc<dyn RemoteCache>>,
    pool: Arc<ConnectionPool<F>>,
    workers: Arc<WorkerPool>,
    monitor: Arc<LatencyMonitor>,
    counters: Counters,
}

impl<F: ConnectionFactory> QueryAccelerator<F> {
    pub fn new(
        config: DncConfig,
        pool: Arc<ConnectionPool<F>>,
        workers: Arc<WorkerPool>,
        l2: Option<Arc<dyn RemoteCache>>,
        monitor: Arc<LatencyMonitor>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let bloom = config.bloom_filter_enabled.then(|| {
            NegativeFilter::new(config.bloom_filter_size, config.bloom_filter_hashes)
        });
        Ok(Self {
            l1: Arc::new(QueryCache::new(config.l1_cache_size, config.eviction_policy)),
            bloom,
            l2,
            pool,
            workers,
            monitor,
            counters: Counters::default(),
            config,
        })
    }

    /// Spawn the L1 sweeper and pool maintenance tasks.
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        vec![
            self.l1
                .spawn_cleanup_task(self.config.cleanup_interval, shutdown.subscribe()),
            self.pool.spawn_maintenance_task(shutdown.subscribe()),
        ]
    }

    /// Resolve the cheapest way to answer a DNC lookup.
    ///
    /// Non-blocking through the cache tiers; only the database path waits,
    /// bounded by the pool's `connection_timeout`.
    pub async fn optimize_query(
        &self,
        phone_number: &str,
    ) -> Result<QueryOptimization<F::Conn>> {
        let started = Instant::now();
        let canonical = canonicalize_number(phone_number).inspect_err(|_| {
            self.counters.invalid_numbers.fetch_add(1, Ordering::Relaxed);
        })?;

        if let Some(result) = self.l1.get(&canonical) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            self.monitor
                .record_latency(QUERY_OPERATION, started.elapsed(), true);
            return Ok(QueryOptimization {
                phone_number: canonical,
                strategy: CacheStrategy::L1Hit,
                result: Some(result),
                requires_db_query: false,
                connection: None,
                worker: None,
            });
        }

        if let Some(bloom) = &self.bloom {
            if bloom.may_contain(&canonical) {
                // Confirmed-negative set says this number is not listed.
                self.counters.skips.fetch_add(1, Ordering::Relaxed);
                self.monitor
                    .record_latency(QUERY_OPERATION, started.elapsed(), true);
                let result = DncResult::not_listed(&canonical);
                return Ok(QueryOptimization {
                    phone_number: canonical,
                    strategy: CacheStrategy::Skip,
                    result: Some(result),
                    requires_db_query: false,
                    connection: None,
                    worker: None,
                });
            }
        }

        if let Some(l2) = &self.l2 {
            match l2.get(&canonical).await {
                Ok(Some(result)) => {
                    // Promote into L1; the L2 TTL is left untouched.
                    self.l1
                        .insert(canonical.clone(), result.clone(), self.config.l1_cache_ttl);
                    self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                    self.monitor
                        .record_latency(QUERY_OPERATION, started.elapsed(), true);
                    return Ok(QueryOptimization {
                        phone_number: canonical,
                        strategy: CacheStrategy::L2Hit,
                        result: Some(result),
                        requires_db_query: false,
                        connection: None,
                        worker: None,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %e,
                        backend = l2.name(),
                        "L2 probe failed, treating as miss"
                    );
                }
            }
        }

        let connection = self.pool.get().await?;
        let worker = self.workers.try_lease();
        self.counters.db_queries.fetch_add(1, Ordering::Relaxed);
        self.monitor
            .record_latency(QUERY_OPERATION, started.elapsed(), false);
        Ok(QueryOptimization {
            phone_number: canonical,
            strategy: CacheStrategy::RequiresDb,
            result: None,
            requires_db_query: true,
            connection: Some(connection),
            worker,
        })
    }

    /// Admit a database result into the cache tiers.
    ///
    /// L1 always; L2 best-effort (failures logged and counted); the negative
    /// filter only for numbers confirmed absent from the registry.
    pub async fn cache_result(
        &self,
        phone_number: &str,
        result: DncResult,
        is_on_dnc: bool,
    ) -> Result<()> {
        let canonical = canonicalize_number(phone_number)?;

        self.l1
            .insert(canonical.clone(), result.clone(), self.config.l1_cache_ttl);

        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.set(&canonical, &result, self.config.l2_cache_ttl).await {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    backend = l2.name(),
                    number = %canonical,
                    "best-effort L2 write failed"
                );
            }
        }

        if !is_on_dnc {
            if let Some(bloom) = &self.bloom {
                bloom.add(&canonical);
            }
        }
        Ok(())
    }

    /// Return a database connection to the pool.
    pub async fn release_connection(&self, connection: PooledConnection<F::Conn>) {
        self.pool.put_back(connection).await;
    }

    pub fn l1(&self) -> &QueryCache {
        &self.l1
    }

    pub fn bloom(&self) -> Option<&NegativeFilter> {
        self.bloom.as_ref()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn stats(&self) -> AcceleratorStats {
        AcceleratorStats {
            skips: self.counters.skips.load(Ordering::Relaxed),
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            db_queries: self.counters.db_queries.load(Ordering::Relaxed),
            invalid_numbers: self.counters.invalid_numbers.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
        }
    }
}
