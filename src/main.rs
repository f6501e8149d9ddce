//! Ferry outbox relay service.
//!
//! Connects to the event log and the destination streams, bootstraps the
//! outbox schema, runs the relay workers, and stops them cleanly on
//! CTRL+C or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use ferry_core::{schema, RealClock};
use ferry_relay::{RedisStreamSink, RelayEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        redis_url = %config.redis_url_masked(),
        worker_count = config.worker_count,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval_ms,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::ensure_schema(&pool).await.context("failed to create outbox schema")?;
    info!("outbox schema ready");

    let sink = RedisStreamSink::connect(config.to_sink_config())
        .await
        .context("failed to connect to destination streams")?;
    info!("destination stream connection established");

    let mut engine = RelayEngine::new(
        &pool,
        Arc::new(sink),
        config.to_relay_config(),
        Arc::new(RealClock::new()),
    )?;
    engine.start().await?;
    info!("ferry relay is running");

    shutdown_signal().await?;
    info!("shutdown signal received, stopping relay workers");

    let stats = engine.stats().await;
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "relay engine did not shut down cleanly");
    }
    info!(
        cycles = stats.cycles,
        published = stats.events_published,
        retried = stats.events_retried,
        poisoned = stats.events_poisoned,
        abandoned_cycles = stats.abandoned_cycles,
        "relay engine stopped"
    );

    pool.close().await;
    info!("ferry shutdown complete");
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` in the environment wins over
/// the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

/// Creates the connection pool, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for CTRL+C")?;
                info!("received CTRL+C signal");
            },
            _ = terminate.recv() => {
                info!("received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for CTRL+C")?;
        info!("received CTRL+C signal");
    }

    Ok(())
}
