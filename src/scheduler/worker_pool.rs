//! Worker pool for driving runs from a shared queue.
//!
//! Each worker runs as an independent tokio task, pulls run ids from the
//! queue and drives each run to its next stopping point. Shutdown is
//! broadcast; a worker finishes the run it is driving before stopping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::metrics::MetricsCollector;
use crate::pipeline::config::parse_env_value;
use crate::pipeline::{Orchestrator, RunStatus};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// The run queue no longer accepts submissions.
    #[error("Run queue closed; cannot submit run {0}")]
    QueueClosed(Uuid),

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Maximum queued run ids before `submit` waits.
    pub queue_capacity: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_capacity: 256,
            shutdown_timeout_ms: 60_000,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Reads `REELFORGE_WORKERS`, `REELFORGE_QUEUE_CAPACITY` and
    /// `REELFORGE_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REELFORGE_WORKERS") {
            config.num_workers = parse_env_value(&val, "REELFORGE_WORKERS")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_QUEUE_CAPACITY") {
            config.queue_capacity = parse_env_value(&val, "REELFORGE_QUEUE_CAPACITY")?;
        }
        if let Ok(val) = std::env::var("REELFORGE_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse_env_value(&val, "REELFORGE_SHUTDOWN_TIMEOUT_MS")?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently driving a run.
    pub active_workers: usize,
    /// Runs driven to completion.
    pub runs_completed: u64,
    /// Runs that failed, were cancelled, or could not be driven.
    pub runs_failed: u64,
    /// Runs paused on budget or waiting for review.
    pub runs_paused: u64,
    /// Average time spent driving one run.
    pub average_drive_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of runs driven.
    pub fn total_processed(&self) -> u64 {
        self.runs_completed + self.runs_failed + self.runs_paused
    }

    /// Returns the completion rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.runs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_paused: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_paused: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.runs_completed.load(Ordering::SeqCst);
        let failed = self.runs_failed.load(Ordering::SeqCst);
        let paused = self.runs_paused.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed + paused;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            runs_completed: completed,
            runs_failed: failed,
            runs_paused: paused,
            average_drive_duration: average,
        }
    }
}

/// Worker pool that drives runs submitted to its queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    orchestrator: Arc<Orchestrator>,
    sender: mpsc::Sender<Uuid>,
    receiver: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        // Only ever sent once.
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            orchestrator,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.receiver),
                orchestrator: Arc::clone(&self.orchestrator),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Queue a run to be driven by the next free worker.
    pub async fn submit(&self, run_id: Uuid) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }
        self.sender
            .send(run_id)
            .await
            .map_err(|e| PoolError::QueueClosed(e.0))
    }

    /// Signals every worker to stop and waits for in-flight runs to reach
    /// their next stopping point.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped.
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.shutdown_timeout();
        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker pulling run ids from the shared queue.
struct Worker {
    id: String,
    queue: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    orchestrator: Arc<Orchestrator>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                next = next_run(&self.queue) => next,
            };

            match next {
                Some(run_id) => self.drive(run_id).await,
                None => {
                    info!(worker_id = %self.id, "Run queue closed");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn drive(&self, run_id: Uuid) {
        let started = Instant::now();
        let active = self.stats.increment_active();
        self.metrics.update_workers(active as usize);

        info!(worker_id = %self.id, run_id = %run_id, "Driving run");
        let result = self.orchestrator.drive(run_id).await;
        let duration = started.elapsed();

        let active = self.stats.decrement_active();
        self.metrics.update_workers(active as usize);

        match result {
            Ok(run) => {
                let counter = match run.status {
                    RunStatus::Completed => &self.stats.runs_completed,
                    RunStatus::Paused | RunStatus::AwaitingReview => &self.stats.runs_paused,
                    _ => &self.stats.runs_failed,
                };
                self.stats.record(counter, duration);
                info!(
                    worker_id = %self.id,
                    run_id = %run_id,
                    status = %run.status,
                    duration_ms = duration.as_millis() as u64,
                    "Run stopped"
                );
            }
            Err(e) => {
                self.stats.record(&self.stats.runs_failed, duration);
                warn!(worker_id = %self.id, run_id = %run_id, error = %e, "Could not drive run");
            }
        }
    }
}

async fn next_run(queue: &Mutex<mpsc::Receiver<Uuid>>) -> Option<Uuid> {
    queue.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CriticError;
    use crate::pipeline::{ReelforgeConfig, StageRegistry};
    use crate::quality::{DimensionScores, QualityCritic, QualityReport, Recommendation};
    use crate::storage::{MemoryRunStore, RunStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_queue_capacity(16)
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_worker_pool_config_rejects_zero_workers() {
        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::new(2)
            .with_queue_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            runs_completed: 60,
            runs_failed: 20,
            runs_paused: 20,
            average_drive_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 60.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(&stats.runs_completed, Duration::from_secs(10));
        stats.record(&stats.runs_paused, Duration::from_secs(20));
        stats.record(&stats.runs_failed, Duration::from_secs(5));
        assert_eq!(stats.increment_active(), 1);
        assert_eq!(stats.increment_active(), 2);
        assert_eq!(stats.decrement_active(), 1);

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.runs_completed, 1);
        assert_eq!(pool_stats.runs_paused, 1);
        assert_eq!(pool_stats.runs_failed, 1);
        assert_eq!(pool_stats.active_workers, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert_eq!(pool_stats.average_drive_duration.as_millis(), 11666);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }

    struct IdleCritic;

    #[async_trait]
    impl QualityCritic<Value> for IdleCritic {
        async fn critique(&self, _artifact: &Value) -> Result<QualityReport, CriticError> {
            Ok(QualityReport::new(
                8.0,
                DimensionScores::default(),
                Vec::new(),
                Recommendation::Approve,
            ))
        }
    }

    #[tokio::test]
    async fn test_pool_drives_submitted_runs() {
        let store = Arc::new(MemoryRunStore::new());
        // No executors are registered, so every run fails at ingest.
        let orchestrator = Orchestrator::new(
            ReelforgeConfig::default(),
            Arc::clone(&store) as Arc<dyn RunStore>,
            StageRegistry::new(),
            Arc::new(IdleCritic),
        )
        .unwrap();
        let orchestrator = Arc::new(orchestrator);

        let first = orchestrator.create_run("a", json!({})).await.unwrap();
        let second = orchestrator.create_run("b", json!({})).await.unwrap();

        let mut pool = WorkerPool::new(WorkerPoolConfig::new(2), Arc::clone(&orchestrator));
        assert!(matches!(pool.submit(first.id).await, Err(PoolError::NotRunning)));
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        pool.submit(first.id).await.unwrap();
        pool.submit(second.id).await.unwrap();

        for _ in 0..200 {
            if pool.stats().total_processed() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.runs_failed, 2);
        assert_eq!(stats.active_workers, 0);
        assert_eq!(store.load(first.id).await.unwrap().status, RunStatus::Failed);
        assert!(!pool.is_running());
    }
}
