// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded worker pool with pluggable load balancing and worker recycling.
//!
//! A bounded global queue feeds a dispatcher that routes each task to one
//! worker's private channel according to the configured balancer. Workers
//! that panic end their loop and are respawned with a fresh identifier; a
//! worker whose failure ratio exceeds 10% over more than 100 tasks, or whose
//! age exceeds `worker_recycle_age`, is recycled on the next dispatch.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};

/// Per-worker channel depth. Small so the balancer, not the channel,
/// decides distribution.
const WORKER_CHANNEL_CAPACITY: usize = 1;

/// Recycle a worker once failures exceed this ratio over a meaningful sample.
const RECYCLE_FAILURE_RATIO: f64 = 0.10;
const RECYCLE_MIN_TASKS: u64 = 100;

/// Pool tuning.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of workers.
    pub pool_size: usize,
    /// Bounded global task queue depth.
    pub queue_size: usize,
    /// Workers older than this are recycled.
    pub worker_recycle_age: Duration,
    /// Worker selection strategy.
    pub balancer: BalancerStrategy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            queue_size: 256,
            worker_recycle_age: Duration::from_secs(3600),
            balancer: BalancerStrategy::RoundRobin,
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(mut self) -> Result<Self> {
        if self.pool_size == 0 {
            return Err(Error::Internal("pool_size must be > 0".to_string()));
        }
        if self.queue_size == 0 {
            tracing::warn!("queue_size of zero; using 1");
            self.queue_size = 1;
        }
        Ok(self)
    }
}

/// Task priority hint. The dispatcher currently uses it for logging only;
/// priority scheduling happens upstream in the publisher's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Outcome of one task.
pub type TaskResult = std::result::Result<serde_json::Value, String>;

/// A unit of work routed through the pool.
#[derive(Debug)]
pub struct Task {
    pub task_type: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
    /// Optional completion channel.
    pub result_tx: Option<oneshot::Sender<TaskResult>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            payload,
            result_tx: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a completion channel; returns the receiving half.
    pub fn with_result_channel(mut self) -> (Self, oneshot::Receiver<TaskResult>) {
        let (tx, rx) = oneshot::channel();
        self.result_tx = Some(tx);
        (self, rx)
    }
}

/// Executes tasks on behalf of the pool.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task_type: &str, payload: &serde_json::Value) -> TaskResult;
}

/// Worker selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancerStrategy {
    /// Cycle through workers in order.
    #[default]
    RoundRobin,
    /// Fewest completed + failed tasks.
    LeastConnections,
    /// Highest success-rate x recent-speed weight.
    WeightedRoundRobin,
    /// Lowest mean task duration.
    LatencyBased,
    /// Lowest composite activity score (in-flight, queued, mean latency).
    ResourceBased,
}

impl BalancerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LatencyBased => "latency_based",
            Self::ResourceBased => "resource_based",
        }
    }
}

/// Snapshot of one worker used for balancing decisions and stats.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerView {
    pub id: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub queued: usize,
    pub last_duration_us: u64,
    pub mean_duration_us: u64,
    pub age_secs: u64,
}

impl WorkerView {
    fn tasks(&self) -> u64 {
        self.completed + self.failed
    }

    fn success_rate(&self) -> f64 {
        let tasks = self.tasks();
        if tasks == 0 {
            // No history: treat as perfectly healthy so fresh workers get
            // traffic.
            1.0
        } else {
            self.completed as f64 / tasks as f64
        }
    }
}

/// Pick a worker index for the given strategy. `rr_cursor` breaks ties and
/// drives the round-robin rotation.
fn pick_index(strategy: BalancerStrategy, views: &[WorkerView], rr_cursor: usize) -> usize {
    debug_assert!(!views.is_empty());
    match strategy {
        BalancerStrategy::RoundRobin => rr_cursor % views.len(),
        BalancerStrategy::LeastConnections => views
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.tasks())
            .map(|(i, _)| i)
            .unwrap_or(0),
        BalancerStrategy::WeightedRoundRobin => {
            // weight = success rate x recent speed; speed decays with the
            // last observed duration.
            let weight = |v: &WorkerView| {
                let speed = 1.0 / (v.last_duration_us as f64 + 1.0);
                v.success_rate() * speed
            };
            views
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    weight(a)
                        .partial_cmp(&weight(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(rr_cursor % views.len())
        }
        BalancerStrategy::LatencyBased => views
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.mean_duration_us)
            .map(|(i, _)| i)
            .unwrap_or(0),
        BalancerStrategy::ResourceBased => {
            // Composite activity score standing in for CPU+memory: current
            // occupancy dominates, historical latency breaks ties.
            let score = |v: &WorkerView| {
                (v.in_flight as u64) * 1_000_000 + (v.queued as u64) * 1_000 + v.mean_duration_us
            };
            views
                .iter()
                .enumerate()
                .min_by_key(|(_, v)| score(v))
                .map(|(i, _)| i)
                .unwrap_or(0)
        }
    }
}

#[derive(Default)]
struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    total_duration_ns: AtomicU64,
    last_duration_ns: AtomicU64,
}

struct WorkerHandle {
    id: u64,
    tx: mpsc::Sender<Task>,
    stats: Arc<WorkerStats>,
    panicked: Arc<AtomicBool>,
    spawned_at: Instant,
    _join: JoinHandle<()>,
}

impl WorkerHandle {
    fn view(&self) -> WorkerView {
        let completed = self.stats.completed.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let total_ns = self.stats.total_duration_ns.load(Ordering::Relaxed);
        let tasks = completed + failed;
        WorkerView {
            id: self.id,
            completed,
            failed,
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            queued: WORKER_CHANNEL_CAPACITY.saturating_sub(self.tx.capacity()),
            last_duration_us: self.stats.last_duration_ns.load(Ordering::Relaxed) / 1_000,
            mean_duration_us: if tasks == 0 { 0 } else { total_ns / tasks / 1_000 },
            age_secs: self.spawned_at.elapsed().as_secs(),
        }
    }

    fn needs_recycle(&self, recycle_age: Duration) -> bool {
        if self.panicked.load(Ordering::Relaxed) || self.tx.is_closed() {
            return true;
        }
        if self.spawned_at.elapsed() > recycle_age {
            return true;
        }
        let completed = self.stats.completed.load(Ordering::Relaxed);
        let failed = self.stats.failed.load(Ordering::Relaxed);
        let tasks = completed + failed;
        tasks > RECYCLE_MIN_TASKS && (failed as f64 / tasks as f64) > RECYCLE_FAILURE_RATIO
    }
}

/// Pool-wide statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub workers: Vec<WorkerView>,
    pub queued: usize,
    pub submitted_total: u64,
    pub rejected_total: u64,
    pub recycled_total: u64,
    pub balancer: &'static str,
}

/// A reserved unit of worker capacity, for callers executing work inline
/// rather than through the queue. Dropping the lease releases the slot.
#[derive(Debug)]
pub struct WorkerLease {
    _permit: OwnedSemaphorePermit,
}

/// Bounded worker pool.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue_tx: mpsc::Sender<Task>,
    workers: Arc<Mutex<Vec<WorkerHandle>>>,
    lease_sem: Arc<Semaphore>,
    submitted_total: AtomicU64,
    rejected_total: AtomicU64,
    recycled_total: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    _dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<Task>(config.queue_size);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let next_worker_id = Arc::new(AtomicU64::new(0));
        let workers: Vec<WorkerHandle> = (0..config.pool_size)
            .map(|_| {
                let id = next_worker_id.fetch_add(1, Ordering::Relaxed);
                Self::spawn_worker_task(id, Arc::clone(&handler))
            })
            .collect();
        let workers = Arc::new(Mutex::new(workers));
        let recycled_total = Arc::new(AtomicU64::new(0));

        let dispatcher = tokio::spawn(Self::dispatch_loop(
            config,
            queue_rx,
            shutdown_rx,
            Arc::clone(&workers),
            Arc::clone(&handler),
            Arc::clone(&next_worker_id),
            Arc::clone(&recycled_total),
        ));

        Self {
            queue_tx,
            workers,
            lease_sem: Arc::new(Semaphore::new(config.pool_size)),
            submitted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            recycled_total,
            shutdown_tx,
            _dispatcher: dispatcher,
            config,
        }
    }

    fn spawn_worker_task(id: u64, handler: Arc<dyn TaskHandler>) -> WorkerHandle {
        let (tx, mut rx) = mpsc::channel::<Task>(WORKER_CHANNEL_CAPACITY);
        let stats = Arc::new(WorkerStats::default());
        let panicked = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn({
            let stats = Arc::clone(&stats);
            let panicked = Arc::clone(&panicked);
            async move {
                while let Some(mut task) = rx.recv().await {
                    stats.in_flight.store(1, Ordering::Relaxed);
                    let result_tx = task.result_tx.take();
                    let started = Instant::now();
                    let outcome =
                        AssertUnwindSafe(handler.handle(&task.task_type, &task.payload))
                            .catch_unwind()
                            .await;
                    let elapsed_ns =
                        u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                    stats
                        .total_duration_ns
                        .fetch_add(elapsed_ns, Ordering::Relaxed);
                    stats.last_duration_ns.store(elapsed_ns, Ordering::Relaxed);
                    stats.in_flight.store(0, Ordering::Relaxed);

                    match outcome {
                        Ok(result) => {
                            match &result {
                                Ok(_) => stats.completed.fetch_add(1, Ordering::Relaxed),
                                Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
                            };
                            if let Some(tx) = result_tx {
                                let _ = tx.send(result);
                            }
                        }
                        Err(_) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            panicked.store(true, Ordering::Relaxed);
                            if let Some(tx) = result_tx {
                                let _ = tx.send(Err("worker panicked".to_string()));
                            }
                            tracing::warn!(worker_id = id, "worker panicked, will be recycled");
                            break;
                        }
                    }
                }
            }
        });

        WorkerHandle {
            id,
            tx,
            stats,
            panicked,
            spawned_at: Instant::now(),
            _join: join,
        }
    }

    async fn dispatch_loop(
        config: WorkerPoolConfig,
        mut queue_rx: mpsc::Receiver<Task>,
        mut shutdown_rx: broadcast::Receiver<()>,
        workers: Arc<Mutex<Vec<WorkerHandle>>>,
        handler: Arc<dyn TaskHandler>,
        next_worker_id: Arc<AtomicU64>,
        recycled_total: Arc<AtomicU64>,
    ) {
        let mut rr_cursor: usize = 0;
        loop {
            let task = tokio::select! {
                _ = shutdown_rx.recv() => break,
                task = queue_rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let mut task = Some(task);
            while let Some(current) = task.take() {
                // Recycle before selection so dead or worn workers never
                // receive the task.
                {
                    let mut guard = workers.lock();
                    for slot in guard.iter_mut() {
                        if slot.needs_recycle(config.worker_recycle_age) {
                            let id = next_worker_id.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(
                                old_worker = slot.id,
                                new_worker = id,
                                "recycling worker"
                            );
                            *slot = Self::spawn_worker_task(id, Arc::clone(&handler));
                            recycled_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }

                let (tx, picked) = {
                    let guard = workers.lock();
                    let views: Vec<WorkerView> = guard.iter().map(|w| w.view()).collect();
                    let idx = pick_index(config.balancer, &views, rr_cursor);
                    rr_cursor = rr_cursor.wrapping_add(1);
                    (guard[idx].tx.clone(), idx)
                };

                match tx.send(current).await {
                    Ok(()) => {}
                    Err(send_err) => {
                        // Worker died between selection and send; retry on a
                        // recycled worker.
                        tracing::debug!(worker_index = picked, "selected worker gone, retrying");
                        task = Some(send_err.0);
                    }
                }
            }
        }
    }

    /// Enqueue a task. Fails fast with `WorkerPool("queue full")` when the
    /// bounded queue is at capacity.
    pub fn submit_task(&self, task: Task) -> Result<()> {
        match self.queue_tx.try_send(task) {
            Ok(()) => {
                self.submitted_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.rejected_total.fetch_add(1, Ordering::Relaxed);
                Err(Error::WorkerPool("queue full".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::WorkerPool("pool shut down".to_string()))
            }
        }
    }

    /// Reserve worker capacity without waiting. `None` when every slot is
    /// leased.
    pub fn try_lease(&self) -> Option<WorkerLease> {
        Arc::clone(&self.lease_sem)
            .try_acquire_owned()
            .ok()
            .map(|permit| WorkerLease { _permit: permit })
    }

    /// Reserve worker capacity, waiting at most `timeout`.
    pub async fn lease(&self, timeout: Duration) -> Result<WorkerLease> {
        match tokio::time::timeout(timeout, Arc::clone(&self.lease_sem).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(WorkerLease { _permit: permit }),
            Ok(Err(_)) => Err(Error::Internal("lease semaphore closed".to_string())),
            Err(_) => Err(Error::Timeout(format!(
                "no worker lease within {:?}",
                timeout
            ))),
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let workers = self.workers.lock();
        WorkerPoolStats {
            workers: workers.iter().map(|w| w.view()).collect(),
            queued: self
                .config
                .queue_size
                .saturating_sub(self.queue_tx.capacity()),
            submitted_total: self.submitted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            recycled_total: self.recycled_total.load(Ordering::Relaxed),
            balancer: self.config.balancer.as_str(),
        }
    }

    /// Stop the dispatcher and drop every worker channel. In-flight tasks
    /// finish; queued tasks are dropped.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
        self.workers.lock().clear();
    }
}
