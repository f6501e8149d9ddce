//! Relay engine: configuration, statistics, and worker lifecycle.

use std::{sync::Arc, time::Duration};

use ferry_core::{storage::Storage, Clock};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::{RelayError, Result},
    events::{EventHandler, NoOpEventHandler},
    sink::StreamSink,
    storage::{PostgresRelayStorage, RelayStorage},
    worker::{CycleReport, RelayWorker},
    worker_pool::WorkerPool,
};

/// Relay configuration. Immutable once the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Number of independent pollers.
    pub worker_count: usize,

    /// Maximum events claimed per cycle.
    pub batch_size: usize,

    /// Wait between cycles.
    pub poll_interval: Duration,

    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Checks the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for a zero worker count, batch size,
    /// poll interval, or shutdown timeout.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(RelayError::configuration("worker_count must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(RelayError::configuration("batch_size must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(RelayError::configuration("poll_interval must be greater than 0"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(RelayError::configuration("shutdown_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Counters across all workers since the engine was created.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Workers currently spawned.
    pub active_workers: usize,
    /// Cycles attempted.
    pub cycles: u64,
    /// Cycles rolled back because of a store error.
    pub abandoned_cycles: u64,
    /// Events claimed in committed cycles.
    pub events_claimed: u64,
    /// Events delivered and marked published.
    pub events_published: u64,
    /// Failed deliveries left pending.
    pub events_retried: u64,
    /// Poison messages marked published without delivery.
    pub events_poisoned: u64,
}

/// Owns the relay workers, the stream sink, and their shared state.
pub struct RelayEngine {
    storage: Arc<dyn RelayStorage>,
    sink: Arc<dyn StreamSink>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl RelayEngine {
    /// Creates an engine over any relay storage with an outcome handler.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` is invalid.
    pub fn with_event_handler(
        storage: Arc<dyn RelayStorage>,
        sink: Arc<dyn StreamSink>,
        config: RelayConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            storage,
            sink,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
            event_handler,
        })
    }

    /// Creates a PostgreSQL-backed engine that discards outcome events.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `config` is invalid.
    pub fn new(
        pool: &PgPool,
        sink: Arc<dyn StreamSink>,
        config: RelayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage = Storage::new(pool.clone());
        Self::with_event_handler(
            Arc::new(PostgresRelayStorage::new(&storage)),
            sink,
            config,
            clock,
            Arc::new(NoOpEventHandler::new()),
        )
    }

    /// Spawns the configured workers and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the engine is already running or was
    /// cancelled.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(RelayError::configuration("relay engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(RelayError::configuration("relay engine was cancelled"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "starting outbox relay engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.sink.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.event_handler.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("relay engine started");
        Ok(())
    }

    /// Stops all workers and closes the sink.
    ///
    /// In-flight cycles finish and commit, or roll back, before their worker
    /// exits. The sink is closed even if the workers miss the deadline.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop within
    /// `shutdown_timeout`, or `WorkerPanic` if one panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down relay engine");

        let result = match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                self.cancellation_token.cancel();
                info!("relay engine was not started, shutdown completed immediately");
                Ok(())
            },
        };

        self.sink.close().await;
        result
    }

    /// Returns whether workers are currently running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Returns a snapshot of engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Token that stops every worker when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Runs exactly one cycle on the calling task, without spawned workers.
    ///
    /// # Errors
    ///
    /// Returns the cycle's storage error; the batch is rolled back.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let worker = RelayWorker::new(
            0,
            self.storage.clone(),
            self.sink.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.event_handler.clone(),
            self.clock.clone(),
        );

        worker.run_cycle().await
    }
}
