//! Database access layer for the outbox event log.
//!
//! The repository translates between the event log table and domain models.
//! Business code enqueues through it inside its own transactions, and relay
//! workers claim and settle rows through it inside claim transactions.

use std::sync::Arc;

use sqlx::PgPool;

pub mod outbox_events;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the event log.
    pub outbox_events: Arc<outbox_events::Repository>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);
        Self { outbox_events: Arc::new(outbox_events::Repository::new(pool)) }
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.outbox_events.pool()).await?;

        Ok(())
    }
}
