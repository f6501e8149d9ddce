//! Supervised relay worker tasks.
//!
//! Spawns one task per poller and owns their join handles. Shutdown cancels
//! the shared token and waits for every worker to finish its current cycle.

use std::{sync::Arc, time::Duration};

use ferry_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::{EngineStats, RelayConfig},
    error::{RelayError, Result},
    events::EventHandler,
    sink::StreamSink,
    storage::RelayStorage,
    worker::RelayWorker,
};

/// Pool of relay workers sharing one storage, sink, and cancellation token.
pub struct WorkerPool {
    storage: Arc<dyn RelayStorage>,
    sink: Arc<dyn StreamSink>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool; no workers run until `spawn_workers`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn RelayStorage>,
        sink: Arc<dyn StreamSink>,
        config: RelayConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            sink,
            config,
            stats,
            cancellation_token,
            event_handler,
            clock,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns `worker_count` workers and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the pool has already been spawned.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(RelayError::configuration("relay workers already spawned"));
        }

        info!(worker_count = self.config.worker_count, "spawning relay workers");

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = RelayWorker::new(
                worker_id,
                self.storage.clone(),
                self.sink.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.event_handler.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "relay worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Cancels every worker and waits for them within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers are still running when the window
    /// closes, or `WorkerPanic` for the first worker that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown = async move {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                        first_panic.get_or_insert(RelayError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(RelayError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
