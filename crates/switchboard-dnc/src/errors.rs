// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for DNC acceleration operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// All pooled connections are checked out and the bounded wait elapsed
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Phone number failed canonicalization
    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),

    /// L1 cache failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// L2 (remote cache) failure
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker pool failure (queue full, worker unavailable)
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for DNC acceleration operations
pub type Result<T> = std::result::Result<T, Error>;
