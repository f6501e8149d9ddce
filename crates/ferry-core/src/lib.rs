//! Core outbox model, schema, and repositories.
//!
//! Provides the event log entity and its strongly-typed identifiers, the
//! versioned notification envelope, the error taxonomy, and the repository
//! that business transactions use to enqueue events and relay workers use to
//! claim and settle them. All other crates build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod models;
pub mod schema;
pub mod storage;
pub mod time;

pub use envelope::{EventEnvelope, OutboxEntry, PayloadSummary, RecordId, ENVELOPE_VERSION};
pub use error::{CoreError, Result};
pub use models::{EventId, EventStatus, OutboxEvent};
pub use time::{Clock, RealClock, TestClock};
