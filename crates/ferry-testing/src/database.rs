//! Isolated PostgreSQL databases for integration tests.
//!
//! Each [`TestDatabase`] creates its own database on the server named by
//! `DATABASE_URL`, bootstraps the outbox schema, and drops the database on
//! [`TestDatabase::cleanup`]. Tests never share rows.

use std::time::Duration;

use anyhow::{Context, Result};
use ferry_core::{schema, storage::Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to a freshly created database with the outbox schema applied.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    admin_pool: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates an isolated database.
    ///
    /// # Errors
    ///
    /// Fails if `DATABASE_URL` is missing or the server is unreachable.
    pub async fn new() -> Result<Self> {
        let options = connect_options()?;
        let admin_pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options.clone().database("postgres"))
            .await
            .context("failed to connect to admin database")?;

        let database_name = format!("ferry_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to create database {database_name}"))?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .idle_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options.database(&database_name))
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        schema::ensure_schema(&pool).await.context("failed to create outbox schema")?;

        debug!(database = %database_name, "created isolated test database");
        Ok(Self { pool, admin_pool, database_name })
    }

    /// Pool connected to the isolated database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repository container over this database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Name of the isolated database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes connections and drops the database.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be dropped.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let drop_statement = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name);
        if let Err(e) = sqlx::query(&drop_statement).execute(&self.admin_pool).await {
            warn!(database = %self.database_name, error = %e, "forced drop failed, retrying");
            sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.database_name))
                .execute(&self.admin_pool)
                .await
                .with_context(|| format!("failed to drop database {}", self.database_name))?;
        }

        self.admin_pool.close().await;
        Ok(())
    }
}

fn connect_options() -> Result<PgConnectOptions> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;
    database_url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")
}
