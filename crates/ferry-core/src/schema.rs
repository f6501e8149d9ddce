//! Event log schema bootstrap.
//!
//! Statements are idempotent so every process can run them at startup.
//! Business tables that enqueue into the log live in the caller's own schema.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

/// Name of the event log table.
pub const OUTBOX_TABLE: &str = "outbox_events";

const STATEMENTS: &[(&str, &str)] = &[
    (
        "create outbox_events",
        r#"
        CREATE TABLE IF NOT EXISTS outbox_events (
            id BIGSERIAL PRIMARY KEY,
            topic TEXT NOT NULL,
            payload BYTEA NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'published')),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            published_at TIMESTAMPTZ,
            CHECK ((status = 'published') = (published_at IS NOT NULL))
        )
        "#,
    ),
    (
        "create pending index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
        ON outbox_events (id)
        WHERE status = 'pending'
        "#,
    ),
    (
        "create retry index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_outbox_events_retrying
        ON outbox_events (retry_count DESC)
        WHERE status = 'pending' AND retry_count > 0
        "#,
    ),
];

/// Creates the event log table and its indexes if they are missing.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        debug!(step = name, "applying outbox schema");
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
