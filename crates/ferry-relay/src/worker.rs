//! Relay poller.
//!
//! Each worker repeats one cycle per tick: claim a batch, settle every event
//! in it oldest-first, commit. Status changes are staged in the claim
//! transaction, so a cycle either lands completely or leaves the batch
//! exactly as it found it.

use std::sync::Arc;

use ferry_core::{Clock, OutboxEvent};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::{EngineStats, RelayConfig},
    error::{RelayError, Result},
    events::{EventHandler, EventPoisoned, EventPublished, EventRetried, RelayEvent},
    sink::StreamSink,
    storage::{Claim, ClaimTransaction, RelayStorage},
    tracker::{self, Input, PayloadCheck, Transition},
};

/// Summary of one committed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Events claimed.
    pub claimed: usize,
    /// Events delivered and marked published.
    pub published: usize,
    /// Events whose delivery failed and stay pending.
    pub retried: usize,
    /// Unparsable events marked published without delivery.
    pub poisoned: usize,
}

impl CycleReport {
    /// Events whose outcome was committed this cycle.
    pub fn settled(&self) -> usize {
        self.published + self.retried + self.poisoned
    }
}

/// Single relay poller.
pub struct RelayWorker {
    id: usize,
    storage: Arc<dyn RelayStorage>,
    sink: Arc<dyn StreamSink>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl RelayWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        storage: Arc<dyn RelayStorage>,
        sink: Arc<dyn StreamSink>,
        config: RelayConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, sink, config, stats, cancellation_token, event_handler, clock }
    }

    /// Worker id used in logs and outcome events.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs cycles on the poll interval until cancelled.
    ///
    /// Cycle failures are logged and the next tick tries again; only
    /// cancellation ends the loop.
    ///
    /// # Errors
    ///
    /// Currently never returns an error. The signature matches the worker
    /// pool's join contract.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = self.id,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.config.batch_size,
            "relay worker starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "relay worker received shutdown signal");
                break;
            }

            // Errors are already logged and counted inside run_cycle.
            let _ = self.run_cycle().await;

            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.config.poll_interval) => {},
            }
        }

        info!(worker_id = self.id, "relay worker stopped");
        Ok(())
    }

    /// Executes exactly one claim, publish, commit cycle.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::StorageError` if claiming, staging a status
    /// change, or committing fails, and the sink's error if it reports a
    /// failure that is not retryable, such as being closed. The claim is
    /// rolled back and every event in the batch stays as it was.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let result = self.cycle().await;

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        match &result {
            Ok(report) => {
                stats.events_claimed += report.claimed as u64;
                stats.events_published += report.published as u64;
                stats.events_retried += report.retried as u64;
                stats.events_poisoned += report.poisoned as u64;
            },
            Err(error) => {
                stats.abandoned_cycles += 1;
                error!(
                    worker_id = self.id,
                    error = %error,
                    category = %crate::error::ErrorCategory::from(error),
                    "relay cycle abandoned"
                );
            },
        }

        result
    }

    async fn cycle(&self) -> Result<CycleReport> {
        let Claim { events, mut transaction } =
            self.storage.claim_batch(self.config.batch_size).await.map_err(|e| {
                RelayError::storage(format!("failed to claim pending events: {e}"))
            })?;

        let mut report = CycleReport { claimed: events.len(), ..CycleReport::default() };
        if events.is_empty() {
            transaction.commit().await?;
            return Ok(report);
        }

        debug!(worker_id = self.id, claimed_count = events.len(), "claimed outbox events");

        let mut outcomes = Vec::with_capacity(events.len());
        for event in &events {
            if self.cancellation_token.is_cancelled() {
                debug!(
                    worker_id = self.id,
                    released = events.len() - outcomes.len(),
                    "shutdown requested mid-batch, releasing unsettled events"
                );
                break;
            }

            let settled = self.settle(event, transaction.as_mut()).await;
            match settled {
                Ok(outcome) => {
                    match &outcome {
                        RelayEvent::Published(_) => report.published += 1,
                        RelayEvent::Retried(_) => report.retried += 1,
                        RelayEvent::Poisoned(_) => report.poisoned += 1,
                    }
                    outcomes.push(outcome);
                },
                Err(error) => {
                    if let Err(rollback_error) = transaction.rollback().await {
                        warn!(
                            worker_id = self.id,
                            error = %rollback_error,
                            "failed to roll back claim transaction"
                        );
                    }
                    return Err(error);
                },
            }
        }

        transaction.commit().await.map_err(|e| {
            RelayError::storage(format!("failed to commit claim transaction: {e}"))
        })?;

        debug!(
            worker_id = self.id,
            published = report.published,
            retried = report.retried,
            poisoned = report.poisoned,
            "relay cycle committed"
        );

        for outcome in outcomes {
            self.event_handler.handle_event(outcome).await;
        }

        Ok(report)
    }

    /// Decides and stages the outcome for one claimed event.
    async fn settle(
        &self,
        event: &OutboxEvent,
        transaction: &mut dyn ClaimTransaction,
    ) -> Result<RelayEvent> {
        match tracker::inspect(event) {
            PayloadCheck::Unparsable(reason) => {
                self.apply(event, transaction, Input::PayloadUnparsable).await?;
                warn!(
                    worker_id = self.id,
                    event_id = %event.id,
                    topic = %event.topic,
                    reason = %reason,
                    "poison message marked published without delivery"
                );
                Ok(RelayEvent::Poisoned(EventPoisoned {
                    event_id: event.id,
                    topic: event.topic.clone(),
                    reason,
                    worker_id: self.id,
                }))
            },
            PayloadCheck::Deliverable(summary) => {
                match self.sink.append(&event.topic, event.payload_bytes()).await {
                    Ok(receipt) => {
                        let published_at =
                            self.apply(event, transaction, Input::DeliverySucceeded).await?.1;
                        debug!(
                            worker_id = self.id,
                            event_id = %event.id,
                            topic = %event.topic,
                            event_type = summary.event_type.as_deref().unwrap_or("unknown"),
                            "event published"
                        );
                        Ok(RelayEvent::Published(EventPublished {
                            event_id: event.id,
                            topic: event.topic.clone(),
                            stream_entry_id: receipt.entry_id,
                            published_at,
                            worker_id: self.id,
                        }))
                    },
                    // The sink itself is unusable; the event is not at fault.
                    Err(delivery_error) if !delivery_error.is_retryable() => Err(delivery_error),
                    Err(delivery_error) => {
                        let (transition, _) =
                            self.apply(event, transaction, Input::DeliveryFailed).await?;
                        let retry_count = match transition {
                            Transition::Retried { retry_count } => retry_count,
                            _ => event.retry_count.saturating_add(1),
                        };
                        warn!(
                            worker_id = self.id,
                            event_id = %event.id,
                            topic = %event.topic,
                            retry_count,
                            error = %delivery_error,
                            "delivery failed, event stays pending"
                        );
                        Ok(RelayEvent::Retried(EventRetried {
                            event_id: event.id,
                            topic: event.topic.clone(),
                            retry_count,
                            error_message: delivery_error.to_string(),
                            worker_id: self.id,
                        }))
                    },
                }
            },
        }
    }

    /// Runs the state machine for `input` and stages the resulting change.
    ///
    /// Returns the transition as persisted, with the retry count reported by
    /// the store, and the timestamp used for publication.
    async fn apply(
        &self,
        event: &OutboxEvent,
        transaction: &mut dyn ClaimTransaction,
        input: Input,
    ) -> Result<(Transition, chrono::DateTime<chrono::Utc>)> {
        let transition = tracker::next(event.status, event.retry_count, input)
            .map_err(|e| RelayError::storage(format!("event {}: {e}", event.id)))?;
        let now = self.clock.now_utc();

        let persisted = match transition {
            Transition::Published | Transition::Poisoned => {
                transaction.mark_published(event.id, now).await.map_err(|e| {
                    RelayError::storage(format!("failed to mark event {} published: {e}", event.id))
                })?;
                transition
            },
            Transition::Retried { .. } => {
                let retry_count = transaction.record_failure(event.id).await.map_err(|e| {
                    RelayError::storage(format!(
                        "failed to record failure for event {}: {e}",
                        event.id
                    ))
                })?;
                Transition::Retried { retry_count }
            },
        };

        Ok((persisted, now))
    }
}
