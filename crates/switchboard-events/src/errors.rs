// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for event fan-out operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed event or unknown transport
    #[error("Validation error: {0}")]
    Validation(String),

    /// The circuit breaker is open
    #[error("Circuit breaker open")]
    CircuitOpen,

    /// An ingress queue stayed full past the backpressure delay
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// A transport adapter failed a send
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unknown subscription or endpoint
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Event store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Kafka configuration or delivery error
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// Webhook HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The publisher is shutting down
    #[error("Publisher shut down")]
    Shutdown,

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a failed delivery with this error should land in the
    /// dead-letter queue for retry. Validation and not-found failures are
    /// permanent; transport-shaped failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Kafka(_) | Self::Http(_) | Self::Io(_)
        )
    }

    /// Short stable tag for metrics labels and DLQ reasons.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull(_) => "queue_full",
            Self::Transport(_) => "transport",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::Store(_) => "store",
            Self::Kafka(_) => "kafka",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for event fan-out operations
pub type Result<T> = std::result::Result<T, Error>;
