// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Switchboard DNC
//!
//! Latency-sensitive Do-Not-Call lookup acceleration for the exchange's call
//! routing path. A lookup walks the tiers cheapest-first:
//!
//! ```text
//! optimize_query(number)
//!   └─ canonicalize ─▶ L1 (in-process) ─▶ negative filter ─▶ L2 (Redis)
//!                                                             │
//!                                              miss ──▶ connection pool
//!                                                       + worker lease
//! ```
//!
//! Results admitted via `cache_result` land in L1 (always), L2 (best-effort),
//! and the negative filter (confirmed-absent numbers only). The shared
//! [`switchboard_telemetry::LatencyMonitor`] receives every query's latency
//! with its cache-hit flag, which drives SLA scoring and degradation alerts.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use switchboard_dnc::{DncConfig, DncResult, QueryAccelerator};
//!
//! let accelerator = QueryAccelerator::new(
//!     DncConfig::default(),
//!     pool,      // Arc<ConnectionPool<YourFactory>>
//!     workers,   // Arc<WorkerPool>
//!     Some(l2),  // Arc<dyn RemoteCache> (Redis in production)
//!     monitor,   // Arc<LatencyMonitor>
//! )?;
//!
//! let opt = accelerator.optimize_query("+15551234567").await?;
//! if opt.requires_db_query {
//!     // run the registry query on opt.connection, then:
//!     // accelerator.cache_result(&opt.phone_number, result, is_on_dnc).await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod accelerator;
pub mod bloom;
pub mod config;
pub mod conn_pool;
pub mod errors;
pub mod l1_cache;
pub mod l2;
pub mod worker_pool;

pub use accelerator::{
    canonicalize_number, AcceleratorStats, CacheStrategy, QueryAccelerator, QueryOptimization,
};
pub use bloom::NegativeFilter;
pub use config::{DncConfig, EvictionPolicy};
pub use conn_pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection, PooledResource,
};
pub use errors::{Error, Result};
pub use l1_cache::{CacheStats, QueryCache};
pub use l2::{RedisCache, RemoteCache};
pub use worker_pool::{
    BalancerStrategy, Task, TaskHandler, TaskPriority, TaskResult, WorkerLease, WorkerPool,
    WorkerPoolConfig, WorkerPoolStats, WorkerView,
};

/// Outcome of a DNC registry check for one phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DncResult {
    /// Canonical E.164 number.
    pub phone_number: String,
    /// Whether the number appears on a do-not-call registry.
    pub is_on_dnc: bool,
    /// Which registry listed it, when `is_on_dnc` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_source: Option<String>,
    /// When the registry answer was obtained.
    pub checked_at: DateTime<Utc>,
}

impl DncResult {
    /// A confirmed listing from the named registry.
    pub fn listed(phone_number: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            is_on_dnc: true,
            list_source: Some(source.into()),
            checked_at: Utc::now(),
        }
    }

    /// A confirmed absence from every registry consulted.
    pub fn not_listed(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            is_on_dnc: false,
            list_source: None,
            checked_at: Utc::now(),
        }
    }
}
