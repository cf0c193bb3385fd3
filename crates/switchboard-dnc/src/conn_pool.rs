// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded database connection pool.
//!
//! Active checkouts are bounded by a semaphore; idle connections queue for
//! reuse. A connection is healthy iff it answers a ping and is younger than
//! `connection_max_age`. Returns re-queue healthy connections and close the
//! rest. A maintenance task keeps `min_idle` connections warm, reaps idle
//! connections past `idle_max_age`, and pings the idle set on an interval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};

/// Pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Upper bound on active + idle connections.
    pub max_connections: usize,
    /// Idle connections kept warm while running.
    pub min_idle: usize,
    /// Connections older than this are closed on return or checkout.
    pub connection_max_age: Duration,
    /// Idle connections beyond `min_idle` are closed past this idle age.
    pub idle_max_age: Duration,
    /// Bounded wait for a checkout before `PoolExhausted`.
    pub connection_timeout: Duration,
    /// Idle-set ping cadence.
    pub health_check_interval: Duration,
    /// Reaper cadence.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_idle: 2,
            connection_max_age: Duration::from_secs(1800),
            idle_max_age: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn validate(mut self) -> Result<Self> {
        if self.max_connections == 0 {
            return Err(Error::Internal(
                "max_connections must be > 0".to_string(),
            ));
        }
        if self.min_idle > self.max_connections {
            tracing::warn!(
                min_idle = self.min_idle,
                max_connections = self.max_connections,
                "min_idle exceeds max_connections; clamping"
            );
            self.min_idle = self.max_connections;
        }
        if self.connection_timeout.is_zero() {
            tracing::warn!("connection_timeout of zero; using 5s");
            self.connection_timeout = Duration::from_secs(5);
        }
        Ok(self)
    }
}

/// A poolable connection.
#[async_trait]
pub trait PooledResource: Send + 'static {
    /// Liveness probe.
    async fn ping(&mut self) -> bool;

    /// Graceful close. Dropping without close is acceptable but noisier on
    /// the server side.
    async fn close(&mut self);
}

/// Creates connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: PooledResource;

    async fn connect(&self) -> Result<Self::Conn>;
}

struct IdleConn<C> {
    conn: C,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Debug)]
struct PoolShared {
    /// active + idle, bounded by max_connections.
    total: AtomicUsize,
    active: AtomicUsize,
    created_total: AtomicU64,
    closed_total: AtomicU64,
    exhausted_total: AtomicU64,
}

/// Snapshot of pool state.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub created_total: u64,
    pub closed_total: u64,
    pub exhausted_total: u64,
    pub max_connections: usize,
    pub min_idle: usize,
}

/// A checked-out connection. Return it with [`ConnectionPool::put_back`];
/// dropping it instead closes the connection unceremoniously.
#[derive(Debug)]
pub struct PooledConnection<C: PooledResource> {
    conn: Option<C>,
    created_at: Instant,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl<C: PooledResource> PooledConnection<C> {
    /// Age since the underlying connection was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Access the underlying connection.
    pub fn conn_mut(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }
}

impl<C: PooledResource> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
            self.shared.total.fetch_sub(1, Ordering::Relaxed);
            self.shared.closed_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bounded async connection pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<F::Conn>>>,
    /// Bounds concurrent checkouts.
    checkout: Arc<Semaphore>,
    shared: Arc<PoolShared>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            idle: Mutex::new(VecDeque::with_capacity(config.max_connections)),
            checkout: Arc::new(Semaphore::new(config.max_connections)),
            shared: Arc::new(PoolShared {
                total: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                created_total: AtomicU64::new(0),
                closed_total: AtomicU64::new(0),
                exhausted_total: AtomicU64::new(0),
            }),
            config,
        }
    }

    /// Pre-create `min_idle` connections, best-effort.
    pub async fn warm_up(&self) {
        for _ in 0..self.config.min_idle {
            if self.shared.total.load(Ordering::Relaxed) >= self.config.max_connections {
                break;
            }
            match self.factory.connect().await {
                Ok(conn) => {
                    self.shared.total.fetch_add(1, Ordering::Relaxed);
                    self.shared.created_total.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    self.idle.lock().push_back(IdleConn {
                        conn,
                        created_at: now,
                        idle_since: now,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "warm-up connection failed");
                    break;
                }
            }
        }
    }

    /// Check out a connection, waiting at most `connection_timeout`.
    pub async fn get(&self) -> Result<PooledConnection<F::Conn>> {
        let permit = match tokio::time::timeout(
            self.config.connection_timeout,
            Arc::clone(&self.checkout).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Internal("pool semaphore closed".to_string()));
            }
            Err(_) => {
                self.shared.exhausted_total.fetch_add(1, Ordering::Relaxed);
                return Err(Error::PoolExhausted(format!(
                    "no connection within {:?} ({} active)",
                    self.config.connection_timeout,
                    self.shared.active.load(Ordering::Relaxed)
                )));
            }
        };

        // Reuse the freshest idle connection that is still within age.
        loop {
            let candidate = self.idle.lock().pop_back();
            match candidate {
                Some(idle) => {
                    if idle.created_at.elapsed() < self.config.connection_max_age {
                        self.shared.active.fetch_add(1, Ordering::Relaxed);
                        return Ok(PooledConnection {
                            conn: Some(idle.conn),
                            created_at: idle.created_at,
                            shared: Arc::clone(&self.shared),
                            _permit: permit,
                        });
                    }
                    self.close_conn(idle.conn).await;
                }
                None => break,
            }
        }

        let conn = self.factory.connect().await?;
        self.shared.total.fetch_add(1, Ordering::Relaxed);
        self.shared.created_total.fetch_add(1, Ordering::Relaxed);
        self.shared.active.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            created_at: Instant::now(),
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Return a connection. Healthy and within age: re-queued; otherwise
    /// closed.
    pub async fn put_back(&self, mut pooled: PooledConnection<F::Conn>) {
        let Some(mut conn) = pooled.conn.take() else {
            return;
        };
        // The guard's Drop no longer fires its close accounting once the
        // connection is taken; settle the active count here.
        self.shared.active.fetch_sub(1, Ordering::Relaxed);

        let within_age = pooled.created_at.elapsed() < self.config.connection_max_age;
        if within_age && conn.ping().await {
            self.idle.lock().push_back(IdleConn {
                conn,
                created_at: pooled.created_at,
                idle_since: Instant::now(),
            });
        } else {
            self.close_conn(conn).await;
        }
        // Permit releases when `pooled` drops at the end of this call.
    }

    async fn close_conn(&self, mut conn: F::Conn) {
        conn.close().await;
        self.shared.total.fetch_sub(1, Ordering::Relaxed);
        self.shared.closed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Close idle connections beyond `min_idle` that have been idle past
    /// `idle_max_age`. Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let mut to_close = Vec::new();
        {
            let mut idle = self.idle.lock();
            while idle.len() > self.config.min_idle {
                let oldest_is_stale = idle
                    .front()
                    .map(|c| c.idle_since.elapsed() > self.config.idle_max_age)
                    .unwrap_or(false);
                if !oldest_is_stale {
                    break;
                }
                if let Some(stale) = idle.pop_front() {
                    to_close.push(stale.conn);
                }
            }
        }
        let reaped = to_close.len();
        for conn in to_close {
            self.close_conn(conn).await;
        }
        reaped
    }

    /// Ping every idle connection; close the ones that fail or aged out,
    /// then top back up to `min_idle`.
    pub async fn health_check(&self) {
        let drained: Vec<IdleConn<F::Conn>> = {
            let mut idle = self.idle.lock();
            idle.drain(..).collect()
        };
        for mut idle_conn in drained {
            let within_age =
                idle_conn.created_at.elapsed() < self.config.connection_max_age;
            if within_age && idle_conn.conn.ping().await {
                self.idle.lock().push_back(idle_conn);
            } else {
                self.close_conn(idle_conn.conn).await;
            }
        }

        // Keep the warm minimum.
        while self.idle.lock().len() < self.config.min_idle
            && self.shared.total.load(Ordering::Relaxed) < self.config.max_connections
        {
            match self.factory.connect().await {
                Ok(conn) => {
                    self.shared.total.fetch_add(1, Ordering::Relaxed);
                    self.shared.created_total.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    self.idle.lock().push_back(IdleConn {
                        conn,
                        created_at: now,
                        idle_since: now,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "min-idle replenish failed");
                    break;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.shared.total.load(Ordering::Relaxed),
            active: self.shared.active.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            created_total: self.shared.created_total.load(Ordering::Relaxed),
            closed_total: self.shared.closed_total.load(Ordering::Relaxed),
            exhausted_total: self.shared.exhausted_total.load(Ordering::Relaxed),
            max_connections: self.config.max_connections,
            min_idle: self.config.min_idle,
        }
    }

    /// Spawn the reaper + health-check maintenance task.
    pub fn spawn_maintenance_task(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut reap = tokio::time::interval(pool.config.reap_interval);
            reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut health = tokio::time::interval(pool.config.health_check_interval);
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = reap.tick() => {
                        let reaped = pool.reap_idle().await;
                        if reaped > 0 {
                            tracing::debug!(reaped, "reaped idle connections");
                        }
                    }
                    _ = health.tick() => {
                        pool.health_check().await;
                    }
                }
            }
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct StubConn {
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicU64>,
    }

    #[async_trait]
    impl PooledResource for StubConn {
        async fn ping(&mut self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct StubFactory {
        created: Arc<AtomicU64>,
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicU64>,
    }

    impl StubFactory {
        fn new() -> Self {
            Self {
                created: Arc::new(AtomicU64::new(0)),
                healthy: Arc::new(AtomicBool::new(true)),
                closed: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        type Conn = StubConn;

        async fn connect(&self) -> Result<StubConn> {
            self.created.fetch_add(1, Ordering::Relaxed);
            Ok(StubConn {
                healthy: Arc::clone(&self.healthy),
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            max_connections: 2,
            min_idle: 0,
            connection_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn get_creates_then_reuses() {
        let factory = StubFactory::new();
        let created = Arc::clone(&factory.created);
        let pool = ConnectionPool::new(factory, small_config());

        let conn = pool.get().await.unwrap();
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().active, 1);

        pool.put_back(conn).await;
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);

        let _conn = pool.get().await.unwrap();
        // Reused the idle connection, no new create.
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhaustion_fails_with_pool_exhausted() {
        let pool = ConnectionPool::new(StubFactory::new(), small_config());
        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();

        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert_eq!(pool.stats().exhausted_total, 1);
    }

    #[tokio::test]
    async fn unhealthy_connection_closed_on_return() {
        let factory = StubFactory::new();
        let healthy = Arc::clone(&factory.healthy);
        let closed = Arc::clone(&factory.closed);
        let pool = ConnectionPool::new(factory, small_config());

        let conn = pool.get().await.unwrap();
        healthy.store(false, Ordering::Relaxed);
        pool.put_back(conn).await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn over_age_connection_closed_on_return() {
        let factory = StubFactory::new();
        let closed = Arc::clone(&factory.closed);
        let pool = ConnectionPool::new(
            StubFactory {
                created: factory.created,
                healthy: factory.healthy,
                closed: factory.closed,
            },
            PoolConfig {
                connection_max_age: Duration::ZERO,
                ..small_config()
            },
        );

        let conn = pool.get().await.unwrap();
        pool.put_back(conn).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn active_plus_idle_never_exceeds_max() {
        let pool = Arc::new(ConnectionPool::new(StubFactory::new(), small_config()));
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put_back(a).await;

        let stats = pool.stats();
        assert!(stats.active + stats.idle <= stats.max_connections);
        pool.put_back(b).await;
        let stats = pool.stats();
        assert!(stats.active + stats.idle <= stats.max_connections);
    }

    #[tokio::test]
    async fn dropping_without_return_closes() {
        let pool = ConnectionPool::new(StubFactory::new(), small_config());
        {
            let _conn = pool.get().await.unwrap();
        }
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().total, 0);
        assert_eq!(pool.stats().closed_total, 1);
        // Permit came back too.
        let _again = pool.get().await.unwrap();
    }

    #[tokio::test]
    async fn warm_up_fills_min_idle() {
        let pool = ConnectionPool::new(
            StubFactory::new(),
            PoolConfig {
                max_connections: 4,
                min_idle: 3,
                ..PoolConfig::default()
            },
        );
        pool.warm_up().await;
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.stats().total, 3);
    }

    #[tokio::test]
    async fn reaper_respects_min_idle() {
        let pool = ConnectionPool::new(
            StubFactory::new(),
            PoolConfig {
                max_connections: 4,
                min_idle: 1,
                idle_max_age: Duration::ZERO,
                ..PoolConfig::default()
            },
        );
        pool.warm_up().await;
        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put_back(a).await;
        pool.put_back(b).await;
        assert!(pool.stats().idle >= 2);

        pool.reap_idle().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn health_check_replaces_dead_idle() {
        let factory = StubFactory::new();
        let healthy = Arc::clone(&factory.healthy);
        let created = Arc::clone(&factory.created);
        let pool = ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: 4,
                min_idle: 2,
                ..PoolConfig::default()
            },
        );
        pool.warm_up().await;
        assert_eq!(created.load(Ordering::Relaxed), 2);

        // All idle connections go bad; the check closes and replenishes.
        healthy.store(false, Ordering::Relaxed);
        pool.health_check().await;
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(created.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn config_validation_clamps_min_idle() {
        let config = PoolConfig {
            max_connections: 2,
            min_idle: 10,
            ..PoolConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(config.min_idle, 2);
    }
}
