//! Storage abstraction for the relay.
//!
//! A claim is a transaction holding row locks on a batch of pending events.
//! Status updates for the batch go through that same transaction, so they
//! become visible together with the lock release, or not at all.
//! Production uses PostgreSQL `FOR UPDATE SKIP LOCKED`; tests use the
//! in-memory [`mock::MockRelayStorage`] which reproduces the same claiming
//! and commit/rollback semantics.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use ferry_core::{
    error::Result,
    models::{EventId, OutboxEvent},
    storage::{outbox_events::Repository, Storage},
};
use sqlx::{Postgres, Transaction};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A batch of events claimed by one worker for one cycle.
pub struct Claim {
    /// Claimed events, oldest first.
    pub events: Vec<OutboxEvent>,
    /// Transaction holding the claim locks.
    pub transaction: Box<dyn ClaimTransaction>,
}

/// Transaction that holds a claim and stages status changes for it.
///
/// Dropping it without `commit` discards staged changes and releases the
/// claim, leaving every event exactly as it was before the cycle.
pub trait ClaimTransaction: Send {
    /// Stages `pending → published`.
    fn mark_published(
        &mut self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Stages a failed attempt and returns the new retry count.
    fn record_failure(&mut self, event_id: EventId) -> BoxFuture<'_, Result<i32>>;

    /// Applies staged changes and releases the claim.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;

    /// Discards staged changes and releases the claim.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Event log operations needed by relay workers.
pub trait RelayStorage: Send + Sync + 'static {
    /// Claims up to `batch_size` pending events that no other claim holds.
    fn claim_batch(&self, batch_size: usize) -> BoxFuture<'_, Result<Claim>>;
}

/// PostgreSQL relay storage over the event log repository.
pub struct PostgresRelayStorage {
    repository: Arc<Repository>,
}

impl PostgresRelayStorage {
    /// Creates a storage adapter.
    pub fn new(storage: &Storage) -> Self {
        Self { repository: storage.outbox_events.clone() }
    }
}

impl RelayStorage for PostgresRelayStorage {
    fn claim_batch(&self, batch_size: usize) -> BoxFuture<'_, Result<Claim>> {
        let repository = self.repository.clone();
        Box::pin(async move {
            let mut tx = repository.begin().await?;
            let events = repository.claim_pending_in_tx(&mut tx, batch_size).await?;
            Ok(Claim {
                events,
                transaction: Box::new(PostgresClaimTransaction { tx, repository }),
            })
        })
    }
}

struct PostgresClaimTransaction {
    tx: Transaction<'static, Postgres>,
    repository: Arc<Repository>,
}

impl ClaimTransaction for PostgresClaimTransaction {
    fn mark_published(
        &mut self,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.repository.mark_published_in_tx(&mut self.tx, event_id, published_at).await
        })
    }

    fn record_failure(&mut self, event_id: EventId) -> BoxFuture<'_, Result<i32>> {
        Box::pin(async move { self.repository.record_failure_in_tx(&mut self.tx, event_id).await })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(self.tx.commit().await?) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(self.tx.rollback().await?) })
    }
}

pub mod mock {
    //! In-memory relay storage for testing.
    //!
    //! Models row locks explicitly: a claimed row is skipped by other claims
    //! until its transaction commits, rolls back, or is dropped. Staged
    //! changes are applied only on commit. Supports error injection and
    //! records how often each row was claimed.

    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        sync::{Arc, Mutex, MutexGuard},
    };

    use chrono::{DateTime, Utc};
    use ferry_core::{
        error::{CoreError, Result},
        models::{EventId, EventStatus, OutboxEvent},
    };

    use super::{BoxFuture, Claim, ClaimTransaction, RelayStorage};

    #[derive(Debug, Default)]
    struct State {
        events: BTreeMap<EventId, OutboxEvent>,
        locked: HashSet<EventId>,
        claim_counts: HashMap<EventId, usize>,
        next_id: i64,
        claim_error: Option<String>,
        update_error: Option<String>,
        commit_error: Option<String>,
    }

    #[derive(Debug)]
    enum Staged {
        Published(DateTime<Utc>),
        Failed,
    }

    /// Mock relay storage shared by any number of workers.
    #[derive(Debug, Clone, Default)]
    pub struct MockRelayStorage {
        state: Arc<Mutex<State>>,
    }

    impl MockRelayStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|p| p.into_inner())
        }

        /// Inserts a committed pending event and returns its id.
        pub fn insert_pending(&self, topic: &str, payload: &[u8]) -> EventId {
            let mut state = self.state();
            state.next_id += 1;
            let id = EventId(state.next_id);
            state.events.insert(
                id,
                OutboxEvent {
                    id,
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    status: EventStatus::Pending,
                    retry_count: 0,
                    created_at: Utc::now(),
                    published_at: None,
                },
            );
            id
        }

        /// Returns a snapshot of an event's committed state.
        pub fn event(&self, event_id: EventId) -> Option<OutboxEvent> {
            self.state().events.get(&event_id).cloned()
        }

        /// Returns all committed events, oldest first.
        pub fn events(&self) -> Vec<OutboxEvent> {
            self.state().events.values().cloned().collect()
        }

        /// Counts committed events with `status`.
        pub fn count_by_status(&self, status: EventStatus) -> usize {
            self.state().events.values().filter(|e| e.status == status).count()
        }

        /// Number of times `event_id` has been claimed.
        pub fn claim_count(&self, event_id: EventId) -> usize {
            self.state().claim_counts.get(&event_id).copied().unwrap_or(0)
        }

        /// Number of rows currently locked by open claims.
        pub fn locked_count(&self) -> usize {
            self.state().locked.len()
        }

        /// Fails the next claim with `error`.
        pub fn inject_claim_error(&self, error: impl Into<String>) {
            self.state().claim_error = Some(error.into());
        }

        /// Fails the next staged status update with `error`.
        pub fn inject_update_error(&self, error: impl Into<String>) {
            self.state().update_error = Some(error.into());
        }

        /// Fails the next commit with `error`. The claim is released and
        /// staged changes are discarded, as with a real failed commit.
        pub fn inject_commit_error(&self, error: impl Into<String>) {
            self.state().commit_error = Some(error.into());
        }
    }

    impl MockRelayStorage {
        fn apply(&self, staged: Vec<(EventId, Staged)>) -> Result<()> {
            let mut state = self.state();
            if let Some(error) = state.commit_error.take() {
                return Err(CoreError::Database(error));
            }
            for (id, change) in staged {
                if let Some(event) = state.events.get_mut(&id) {
                    match change {
                        Staged::Published(at) => {
                            event.status = EventStatus::Published;
                            event.published_at = Some(at);
                        },
                        Staged::Failed => event.retry_count = event.retry_count.saturating_add(1),
                    }
                }
            }
            Ok(())
        }
    }

    impl RelayStorage for MockRelayStorage {
        fn claim_batch(&self, batch_size: usize) -> BoxFuture<'_, Result<Claim>> {
            let storage = self.clone();
            Box::pin(async move {
                let mut state = storage.state();
                if let Some(error) = state.claim_error.take() {
                    return Err(CoreError::Database(error));
                }

                let ids: Vec<EventId> = state
                    .events
                    .values()
                    .filter(|e| e.status == EventStatus::Pending && !state.locked.contains(&e.id))
                    .take(batch_size)
                    .map(|e| e.id)
                    .collect();

                let mut events = Vec::with_capacity(ids.len());
                for id in &ids {
                    state.locked.insert(*id);
                    *state.claim_counts.entry(*id).or_insert(0) += 1;
                    if let Some(event) = state.events.get(id) {
                        events.push(event.clone());
                    }
                }
                drop(state);

                Ok(Claim {
                    events,
                    transaction: Box::new(MockClaimTransaction {
                        storage,
                        claimed: ids,
                        staged: Vec::new(),
                    }),
                })
            })
        }
    }

    struct MockClaimTransaction {
        storage: MockRelayStorage,
        claimed: Vec<EventId>,
        staged: Vec<(EventId, Staged)>,
    }

    impl MockClaimTransaction {
        fn check_claimed(&self, event_id: EventId) -> Result<()> {
            let mut state = self.storage.state();
            if let Some(error) = state.update_error.take() {
                return Err(CoreError::Database(error));
            }
            if !self.claimed.contains(&event_id) {
                return Err(CoreError::NotFound(format!("pending event {event_id}")));
            }
            Ok(())
        }

        fn release(&mut self) {
            let mut state = self.storage.state();
            for id in self.claimed.drain(..) {
                state.locked.remove(&id);
            }
        }
    }

    impl ClaimTransaction for MockClaimTransaction {
        fn mark_published(
            &mut self,
            event_id: EventId,
            published_at: DateTime<Utc>,
        ) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.check_claimed(event_id)?;
                self.staged.push((event_id, Staged::Published(published_at)));
                Ok(())
            })
        }

        fn record_failure(&mut self, event_id: EventId) -> BoxFuture<'_, Result<i32>> {
            Box::pin(async move {
                self.check_claimed(event_id)?;
                let current = self
                    .storage
                    .event(event_id)
                    .map(|e| e.retry_count)
                    .ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))?;
                self.staged.push((event_id, Staged::Failed));
                Ok(current.saturating_add(1))
            })
        }

        fn commit(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                let staged = std::mem::take(&mut self.staged);
                let result = self.storage.apply(staged);
                self.release();
                result
            })
        }

        fn rollback(mut self: Box<Self>) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                self.staged.clear();
                self.release();
                Ok(())
            })
        }
    }

    impl Drop for MockClaimTransaction {
        fn drop(&mut self) {
            self.release();
        }
    }
}
