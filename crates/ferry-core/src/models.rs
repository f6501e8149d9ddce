//! Event log entity and strongly-typed identifiers.
//!
//! Defines the outbox event row, its status lifecycle, and the database
//! encoding for the newtype wrappers so repositories can bind and decode
//! them directly.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Store-assigned event identifier.
///
/// Allocated from a sequence at insert time, so ids increase monotonically
/// with insertion order. The relay uses this ordering for oldest-first
/// claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Relay status of an outbox event.
///
/// ```text
/// pending ──deliver ok──────────▶ published
///    │  ╲
///    │   ╲──payload unparsable──▶ published
///    ▼
/// pending (retry_count + 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting to be claimed and delivered.
    Pending,

    /// Terminal. Either delivered, or dropped as unprocessable.
    Published,
}

impl EventStatus {
    /// Returns the database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
        }
    }

    /// Returns whether no further transitions can occur.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Published)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            _ => Err(format!("invalid event status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for EventStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for EventStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A row of the outbox event log.
///
/// Created `pending` inside the business transaction that caused it, then
/// settled by exactly one relay worker per cycle. Rows are never deleted by
/// the relay.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Store-assigned identifier.
    pub id: EventId,

    /// Destination stream name.
    pub topic: String,

    /// Serialized notification body, normally an
    /// [`EventEnvelope`](crate::EventEnvelope).
    pub payload: Vec<u8>,

    /// Current relay status.
    pub status: EventStatus,

    /// Failed delivery attempts so far. Never decreases.
    pub retry_count: i32,

    /// Insertion time.
    pub created_at: DateTime<Utc>,

    /// When the row reached `published`.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Returns the payload as `Bytes` for handing to a sink.
    pub fn payload_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.payload)
    }
}
