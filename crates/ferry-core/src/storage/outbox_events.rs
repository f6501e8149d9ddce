//! Repository for the outbox event log.
//!
//! Writes happen inside caller-owned transactions: the business transaction
//! for enqueues, the relay's claim transaction for status updates. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent relay workers never hold the same
//! row and never wait on each other.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::warn;

use crate::{
    envelope::OutboxEntry,
    error::{CoreError, Result},
    models::{EventId, EventStatus, OutboxEvent},
};

/// Repository for event log operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Opens a transaction on the pool.
    ///
    /// # Errors
    ///
    /// Returns error if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Appends a notification for a business change.
    ///
    /// Must be called with the same transaction as the mutation it describes;
    /// the row becomes visible to relays only if that transaction commits.
    /// A degraded entry is still written, with an empty payload, so the
    /// mutation never commits without its row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails. The caller should roll back.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &OutboxEntry,
    ) -> Result<EventId> {
        let (payload, degraded) = entry.prepare();
        if let Some(reason) = degraded {
            warn!(
                topic = entry.topic(),
                event_type = %entry.envelope().event_type,
                reason = %reason,
                "payload serialization failed, enqueueing unprocessable payload"
            );
        }

        self.insert_impl(&mut **tx, entry.topic(), &payload).await
    }

    /// Appends an already serialized payload within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_raw_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        payload: &[u8],
    ) -> Result<EventId> {
        self.insert_impl(&mut **tx, topic, payload).await
    }

    /// Appends an already serialized payload in its own statement.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_raw(&self, topic: &str, payload: &[u8]) -> Result<EventId> {
        self.insert_impl(&*self.pool, topic, payload).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, topic: &str, payload: &[u8]) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if topic.is_empty() {
            return Err(CoreError::InvalidInput("topic must not be empty".to_string()));
        }

        let id = sqlx::query_scalar(
            r#"
            INSERT INTO outbox_events (topic, payload, status, retry_count)
            VALUES ($1, $2, 'pending', 0)
            RETURNING id
            "#,
        )
        .bind(topic)
        .bind(payload)
        .fetch_one(executor)
        .await?;

        Ok(EventId(id))
    }

    /// Locks up to `batch_size` pending events, oldest first.
    ///
    /// Rows already locked by another transaction are skipped rather than
    /// waited on. The locks last until `tx` ends, so status updates for the
    /// batch must go through the same transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the select fails.
    pub async fn claim_pending_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch_size: usize,
    ) -> Result<Vec<OutboxEvent>> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, payload, status, retry_count, created_at, published_at
            FROM outbox_events
            WHERE status = 'pending'
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        Ok(events)
    }

    /// Marks a claimed event as published.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event is not pending.
    pub async fn mark_published_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .bind(published_at)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pending event {event_id}")));
        }

        Ok(())
    }

    /// Records a failed delivery attempt, leaving the event pending.
    ///
    /// Returns the new retry count.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event is not pending.
    pub async fn record_failure_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
    ) -> Result<i32> {
        let retry_count = sqlx::query_scalar(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1
            WHERE id = $1 AND status = 'pending'
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut **tx)
        .await?;

        retry_count.ok_or_else(|| CoreError::NotFound(format!("pending event {event_id}")))
    }

    /// Finds an event by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<OutboxEvent>> {
        self.find_by_id_impl(&*self.pool, event_id).await
    }

    /// Finds an event by ID within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
    ) -> Result<Option<OutboxEvent>> {
        self.find_by_id_impl(&mut **tx, event_id).await
    }

    async fn find_by_id_impl<'e, E>(
        &self,
        executor: E,
        event_id: EventId,
    ) -> Result<Option<OutboxEvent>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let event = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, payload, status, retry_count, created_at, published_at
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(executor)
        .await?;

        Ok(event)
    }

    /// Counts events by status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self, status: EventStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM outbox_events
            WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Lists pending events that have failed at least `min_retry_count` times.
    ///
    /// There is no automatic dead-lettering; operators use this to find rows
    /// whose destination keeps rejecting them. Highest retry count first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_retrying(&self, min_retry_count: i32, limit: i64) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, payload, status, retry_count, created_at, published_at
            FROM outbox_events
            WHERE status = 'pending' AND retry_count >= $1
            ORDER BY retry_count DESC, id ASC
            LIMIT $2
            "#,
        )
        .bind(min_retry_count.max(1))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }
}
