//! Outbox relay: moves committed events from the event log to streams.
//!
//! Workers poll the `outbox_events` table, claim a bounded batch of pending
//! rows with `FOR UPDATE SKIP LOCKED`, append each payload to the stream
//! named by its topic, and commit every status change in the transaction that
//! holds the claim. Several workers, in one process or many, share the load
//! without coordination: a row locked by one claim is invisible to others.
//!
//! Per event, oldest first:
//!
//! 1. **Inspect** - undecodable payloads are poison and settle as published
//!    without delivery
//! 2. **Append** - raw payload to the topic's stream, bounded by a timeout
//! 3. **Stage** - `published` on success, `retry_count + 1` on failure
//!
//! Delivery is at-least-once. A crash between append and commit leaves the
//! row pending and it is delivered again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ferry_core::RealClock;
//! use ferry_relay::{RedisStreamSink, RelayConfig, RelayEngine, RelayError, SinkConfig};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), RelayError> {
//! let sink = Arc::new(RedisStreamSink::connect(SinkConfig::default()).await?);
//! let mut engine =
//!     RelayEngine::new(&pool, sink, RelayConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod events;
pub mod sink;
pub mod storage;
pub mod tracker;
pub mod worker;
pub mod worker_pool;

pub use engine::{EngineStats, RelayConfig, RelayEngine};
pub use error::{ErrorCategory, RelayError, Result};
pub use events::{EventHandler, MulticastEventHandler, NoOpEventHandler, RelayEvent};
pub use sink::{DeliveryReceipt, RedisStreamSink, SinkConfig, StreamSink};
pub use storage::{Claim, ClaimTransaction, PostgresRelayStorage, RelayStorage};
pub use worker::{CycleReport, RelayWorker};

/// Default number of relay workers per engine.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default maximum events claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default wait between cycles in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default approximate maximum stream length passed to `XADD MAXLEN ~`.
pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

/// Default timeout for a single stream append in milliseconds.
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
