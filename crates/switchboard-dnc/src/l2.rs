// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! L2 remote cache behind a small trait so the accelerator can run with
//! Redis, a test double, or nothing at all.
//!
//! L2 is strictly best-effort: every failure degrades to a cache miss and is
//! logged and counted, never propagated to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::errors::Result;
use crate::DncResult;

/// Remote cache contract.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Fetch a cached result, `None` on miss.
    async fn get(&self, number: &str) -> Result<Option<DncResult>>;

    /// Store a result with a TTL.
    async fn set(&self, number: &str, result: &DncResult, ttl: Duration) -> Result<()>;

    /// Backend name for logs and stats.
    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Redis-backed L2 cache. Values are JSON; keys are namespaced under a
/// versioned prefix so wire-format changes can roll without flushes.
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
    get_errors: AtomicU64,
    set_errors: AtomicU64,
}

impl RedisCache {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self::with_prefix(conn, "dnc:v1")
    }

    pub fn with_prefix(conn: redis::aio::ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: prefix.into(),
            get_errors: AtomicU64::new(0),
            set_errors: AtomicU64::new(0),
        }
    }

    /// Connect to a Redis URL and build the cache.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    fn key(&self, number: &str) -> String {
        format!("{}:{}", self.key_prefix, number)
    }

    pub fn get_errors(&self) -> u64 {
        self.get_errors.load(Ordering::Relaxed)
    }

    pub fn set_errors(&self) -> u64 {
        self.set_errors.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteCache for RedisCache {
    async fn get(&self, number: &str) -> Result<Option<DncResult>> {
        let key = self.key(number);
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(&key).await {
            Ok(v) => v,
            Err(e) => {
                self.get_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, number: &str, result: &DncResult, ttl: Duration) -> Result<()> {
        let key = self.key(number);
        let json = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn.set_ex::<_, _, ()>(&key, json, ttl_secs).await {
            self.set_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
