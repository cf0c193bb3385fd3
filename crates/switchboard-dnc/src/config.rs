// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Accelerator configuration: cache sizing, negative-filter geometry,
//! eviction policy, and pool tuning.
//!
//! Construction clamps tunables into sane ranges with a warning rather than
//! failing startup; only structurally impossible values are hard errors.

use std::time::Duration;

use crate::conn_pool::PoolConfig;
use crate::errors::{Error, Result};
use crate::worker_pool::WorkerPoolConfig;

/// How the L1 cache picks a victim when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the least-recently-used entry. Hits refresh recency.
    #[default]
    Lru,
    /// Evict the entry with the lowest access count.
    Lfu,
    /// Evict the entry expiring soonest.
    Ttl,
    /// Evict a uniformly random entry.
    Random,
}

impl EvictionPolicy {
    /// Parse a policy name. Unknown names fall back to LRU with a warning.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "lru" | "" => Self::Lru,
            "lfu" => Self::Lfu,
            "ttl" => Self::Ttl,
            "random" => Self::Random,
            other => {
                tracing::warn!(policy = other, "unknown eviction policy, defaulting to lru");
                Self::Lru
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
            Self::Random => "random",
        }
    }
}

/// Top-level accelerator configuration.
#[derive(Debug, Clone)]
pub struct DncConfig {
    /// Maximum entries in the in-process L1 cache.
    pub l1_cache_size: usize,
    /// TTL applied to L1 entries on insert and on L2 promotion.
    pub l1_cache_ttl: Duration,
    /// TTL applied to L2 writes.
    pub l2_cache_ttl: Duration,
    /// Whether the probabilistic negative filter is consulted.
    pub bloom_filter_enabled: bool,
    /// Bit-array width of the negative filter.
    pub bloom_filter_size: usize,
    /// Number of hash functions in the negative filter.
    pub bloom_filter_hashes: u32,
    /// L1 victim selection policy.
    pub eviction_policy: EvictionPolicy,
    /// How often expired L1 entries are physically removed.
    pub cleanup_interval: Duration,
    /// Database connection pool tuning.
    pub pool: PoolConfig,
    /// Worker pool tuning.
    pub workers: WorkerPoolConfig,
}

impl Default for DncConfig {
    fn default() -> Self {
        Self {
            l1_cache_size: 10_000,
            l1_cache_ttl: Duration::from_secs(300),
            l2_cache_ttl: Duration::from_secs(3600),
            bloom_filter_enabled: true,
            bloom_filter_size: 1_000_000,
            bloom_filter_hashes: 7,
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: Duration::from_secs(60),
            pool: PoolConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl DncConfig {
    /// Validate and clamp. Hard errors only for values with no sane
    /// substitute; everything else warns and clamps.
    pub fn validate(mut self) -> Result<Self> {
        if self.l1_cache_size == 0 {
            return Err(Error::Internal(
                "l1_cache_size must be > 0".to_string(),
            ));
        }
        if self.l1_cache_ttl.is_zero() {
            tracing::warn!("l1_cache_ttl of zero; using 300s");
            self.l1_cache_ttl = Duration::from_secs(300);
        }
        if self.l2_cache_ttl.is_zero() {
            tracing::warn!("l2_cache_ttl of zero; using 3600s");
            self.l2_cache_ttl = Duration::from_secs(3600);
        }
        const MIN_BLOOM_BITS: usize = 64;
        if self.bloom_filter_size < MIN_BLOOM_BITS {
            tracing::warn!(
                provided = self.bloom_filter_size,
                clamped = MIN_BLOOM_BITS,
                "bloom_filter_size too small; clamping"
            );
            self.bloom_filter_size = MIN_BLOOM_BITS;
        }
        const MAX_BLOOM_HASHES: u32 = 16;
        if self.bloom_filter_hashes == 0 {
            tracing::warn!("bloom_filter_hashes of zero; using 1");
            self.bloom_filter_hashes = 1;
        } else if self.bloom_filter_hashes > MAX_BLOOM_HASHES {
            tracing::warn!(
                provided = self.bloom_filter_hashes,
                clamped = MAX_BLOOM_HASHES,
                "bloom_filter_hashes too large; clamping"
            );
            self.bloom_filter_hashes = MAX_BLOOM_HASHES;
        }
        if self.cleanup_interval.is_zero() {
            tracing::warn!("cleanup_interval of zero; using 60s");
            self.cleanup_interval = Duration::from_secs(60);
        }
        self.pool = self.pool.validate()?;
        self.workers = self.workers.validate()?;
        Ok(self)
    }

    /// Load configuration from `SWITCHBOARD_DNC_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            l1_cache_size: env_usize("SWITCHBOARD_DNC_L1_CACHE_SIZE", defaults.l1_cache_size),
            l1_cache_ttl: env_secs("SWITCHBOARD_DNC_L1_CACHE_TTL_SECS", defaults.l1_cache_ttl),
            l2_cache_ttl: env_secs("SWITCHBOARD_DNC_L2_CACHE_TTL_SECS", defaults.l2_cache_ttl),
            bloom_filter_enabled: env_bool(
                "SWITCHBOARD_DNC_BLOOM_ENABLED",
                defaults.bloom_filter_enabled,
            ),
            bloom_filter_size: env_usize(
                "SWITCHBOARD_DNC_BLOOM_SIZE",
                defaults.bloom_filter_size,
            ),
            bloom_filter_hashes: env_u32(
                "SWITCHBOARD_DNC_BLOOM_HASHES",
                defaults.bloom_filter_hashes,
            ),
            eviction_policy: EvictionPolicy::parse(
                &std::env::var("SWITCHBOARD_DNC_EVICTION_POLICY").unwrap_or_default(),
            ),
            cleanup_interval: env_secs(
                "SWITCHBOARD_DNC_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            ),
            pool: defaults.pool,
            workers: defaults.workers,
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

fn env_secs(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or_else(|_| {
                tracing::warn!(var = name, value = %v, "unparsable value, using default");
                default
            }),
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_unchanged() {
        let config = DncConfig::default().validate().unwrap();
        assert_eq!(config.l1_cache_size, 10_000);
        assert_eq!(config.bloom_filter_hashes, 7);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
    }

    #[test]
    fn zero_cache_size_is_a_hard_error() {
        let config = DncConfig {
            l1_cache_size: 0,
            ..DncConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bloom_geometry_is_clamped() {
        let config = DncConfig {
            bloom_filter_size: 3,
            bloom_filter_hashes: 99,
            ..DncConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.bloom_filter_size, 64);
        assert_eq!(config.bloom_filter_hashes, 16);
    }

    #[test]
    fn zero_ttls_fall_back_to_defaults() {
        let config = DncConfig {
            l1_cache_ttl: Duration::ZERO,
            l2_cache_ttl: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            ..DncConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.l1_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.l2_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn eviction_policy_parse() {
        assert_eq!(EvictionPolicy::parse("lru"), EvictionPolicy::Lru);
        assert_eq!(EvictionPolicy::parse(" LFU "), EvictionPolicy::Lfu);
        assert_eq!(EvictionPolicy::parse("ttl"), EvictionPolicy::Ttl);
        assert_eq!(EvictionPolicy::parse("random"), EvictionPolicy::Random);
        assert_eq!(EvictionPolicy::parse("bogus"), EvictionPolicy::Lru);
        assert_eq!(EvictionPolicy::parse(""), EvictionPolicy::Lru);
    }
}
