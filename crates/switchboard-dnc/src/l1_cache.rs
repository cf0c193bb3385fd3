// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process L1 cache for DNC lookup results.
//!
//! Bounded map with per-entry expiry and a pluggable eviction policy. An
//! expired entry is invisible to readers from the moment it expires; physical
//! removal happens on the cleanup cycle. Hits under LRU refresh the entry's
//! recency tick, so eviction order tracks access order, not insert order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::EvictionPolicy;
use crate::DncResult;

#[derive(Debug, Clone)]
struct Entry {
    result: DncResult,
    expires_at: Instant,
    access_count: u64,
    last_access_tick: u64,
}

struct CacheInner {
    map: HashMap<String, Entry>,
    /// Monotonic access clock for LRU ordering.
    tick: u64,
}

/// Exported cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub total_queries: u64,
    pub evictions: u64,
    pub expired_removals: u64,
    /// Moving average of lookup latency in microseconds.
    pub avg_lookup_latency_us: f64,
    pub hit_rate: f64,
    pub policy: &'static str,
}

/// Bounded L1 cache with pluggable eviction.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    policy: EvictionPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
    /// EMA of lookup latency in nanoseconds: avg = (avg + sample) / 2.
    lookup_latency_ema_ns: AtomicU64,
}

impl QueryCache {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::with_capacity(capacity.min(4096)),
                tick: 0,
            }),
            capacity: capacity.max(1),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removals: AtomicU64::new(0),
            lookup_latency_ema_ns: AtomicU64::new(0),
        }
    }

    /// Look up a canonical number. Expired entries read as misses.
    pub fn get(&self, key: &str) -> Option<DncResult> {
        let started = Instant::now();
        let now = Instant::now();
        let result = {
            let mut inner = self.inner.lock();
            inner.tick += 1;
            let tick = inner.tick;
            match inner.map.get_mut(key) {
                Some(entry) if entry.expires_at > now => {
                    entry.access_count += 1;
                    entry.last_access_tick = tick;
                    Some(entry.result.clone())
                }
                _ => None,
            }
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.note_lookup_latency(started.elapsed());
        result
    }

    /// Insert or refresh an entry with the given TTL. Evicts one victim by
    /// policy when inserting a new key at capacity.
    pub fn insert(&self, key: impl Into<String>, result: DncResult, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            // Prefer reclaiming an expired slot over evicting a live entry.
            let expired_key = inner
                .map
                .iter()
                .find(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone());
            if let Some(k) = expired_key {
                inner.map.remove(&k);
                self.expired_removals.fetch_add(1, Ordering::Relaxed);
            } else if let Some(victim) = self.pick_victim(&inner.map) {
                inner.map.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.map.insert(
            key,
            Entry {
                result,
                expires_at: now + ttl,
                access_count: 0,
                last_access_tick: tick,
            },
        );
    }

    fn pick_victim(&self, map: &HashMap<String, Entry>) -> Option<String> {
        match self.policy {
            EvictionPolicy::Lru => map
                .iter()
                .min_by_key(|(_, e)| e.last_access_tick)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => map
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.last_access_tick))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Ttl => map
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Random => {
                if map.is_empty() {
                    return None;
                }
                let idx = rand::thread_rng().gen_range(0..map.len());
                map.keys().nth(idx).cloned()
            }
        }
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.map.len();
        inner.map.retain(|_, e| e.expires_at > now);
        let removed = before - inner.map.len();
        if removed > 0 {
            self.expired_removals
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Remove one key outright.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().map.remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    /// Live entry count, including expired-but-unswept entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn note_lookup_latency(&self, elapsed: Duration) {
        let sample = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let old = self.lookup_latency_ema_ns.load(Ordering::Relaxed);
        let next = if old == 0 { sample } else { (old + sample) / 2 };
        self.lookup_latency_ema_ns.store(next, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            total_queries: total,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removals: self.expired_removals.load(Ordering::Relaxed),
            avg_lookup_latency_us: self.lookup_latency_ema_ns.load(Ordering::Relaxed) as f64
                / 1_000.0,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            policy: self.policy.as_str(),
        }
    }

    /// Spawn the periodic expired-entry sweeper.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let removed = cache.remove_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired L1 entries");
                        }
                    }
                }
            }
        })
    }
}
