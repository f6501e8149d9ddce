//! Versioned notification envelope carried in outbox payloads.
//!
//! Producers describe a change as a before/after snapshot pair tagged with an
//! event type. Every field except `type` is optional on decode so that rows
//! written by older or newer producers still parse.
//!
//! The relay never requires this shape. It only needs a payload to be
//! well-formed JSON, read through [`PayloadSummary`]; anything else in the
//! body belongs to the consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version written by this crate.
pub const ENVELOPE_VERSION: u32 = 1;

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// Identifier of the business record a notification is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Numeric primary key.
    Int(i64),
    /// Textual key such as a UUID or slug.
    Text(String),
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

/// Structured notification body.
///
/// Serialized as camelCase JSON:
///
/// ```json
/// {"version":1,"type":"customer.created","recordId":1,
///  "occurredAt":"2024-01-01T00:00:00Z","before":null,"after":{"name":"Ada"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Envelope schema version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Event type tag, e.g. `customer.updated`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Affected business record.
    #[serde(default)]
    pub record_id: Option<RecordId>,

    /// When the business change happened.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,

    /// Snapshot before the change. Absent for creations.
    #[serde(default)]
    pub before: Option<Value>,

    /// Snapshot after the change. Absent for deletions.
    #[serde(default)]
    pub after: Option<Value>,
}

impl EventEnvelope {
    /// Decodes a stored payload.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the bytes are not a well-formed envelope.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encodes the envelope as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error only if a snapshot value fails to serialize.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// What the relay reads from a stored payload before delivering it.
///
/// Any well-formed JSON document is accepted, including envelopes with
/// fields this crate would not decode (a float `recordId`, a non RFC 3339
/// `occurredAt`, a string `version`) and bodies that are not envelopes at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadSummary {
    /// The top-level `type` string, when present.
    pub event_type: Option<String>,
}

impl PayloadSummary {
    /// Reads a stored payload.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the bytes are not well-formed JSON. The
    /// relay treats such rows as poison messages.
    pub fn read(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(payload)?;
        let event_type = value.get("type").and_then(Value::as_str).map(str::to_owned);
        Ok(Self { event_type })
    }
}

/// Builder for an outbox row, filled in by business code before enqueueing.
///
/// Snapshot serialization happens eagerly. A snapshot that fails to
/// serialize marks the entry degraded instead of aborting, so the enqueue
/// still writes a row and the enclosing transaction keeps its notification.
///
/// ```
/// use ferry_core::OutboxEntry;
///
/// let entry = OutboxEntry::new("stream.customer.record", "customer.created")
///     .record_id(1)
///     .after(&serde_json::json!({"name": "Ada"}));
/// assert!(!entry.is_degraded());
/// ```
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    topic: String,
    envelope: EventEnvelope,
    degraded: Option<String>,
}

impl OutboxEntry {
    /// Starts an entry for `topic` tagged with `event_type`.
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            envelope: EventEnvelope {
                version: ENVELOPE_VERSION,
                event_type: event_type.into(),
                record_id: None,
                occurred_at: Some(Utc::now()),
                before: None,
                after: None,
            },
            degraded: None,
        }
    }

    /// Sets the affected record id.
    #[must_use]
    pub fn record_id(mut self, id: impl Into<RecordId>) -> Self {
        self.envelope.record_id = Some(id.into());
        self
    }

    /// Overrides the change timestamp.
    #[must_use]
    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.envelope.occurred_at = Some(at);
        self
    }

    /// Attaches the before-snapshot.
    #[must_use]
    pub fn before<T: Serialize + ?Sized>(mut self, snapshot: &T) -> Self {
        match serde_json::to_value(snapshot) {
            Ok(value) => self.envelope.before = Some(value),
            Err(e) => self.degraded = Some(format!("before snapshot: {e}")),
        }
        self
    }

    /// Attaches the after-snapshot.
    #[must_use]
    pub fn after<T: Serialize + ?Sized>(mut self, snapshot: &T) -> Self {
        match serde_json::to_value(snapshot) {
            Ok(value) => self.envelope.after = Some(value),
            Err(e) => self.degraded = Some(format!("after snapshot: {e}")),
        }
        self
    }

    /// Destination stream name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The envelope that will be stored.
    pub fn envelope(&self) -> &EventEnvelope {
        &self.envelope
    }

    /// Returns whether a snapshot failed to serialize.
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// Serialization failure description, if any.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    /// Produces the payload bytes to persist.
    ///
    /// Degraded entries yield an empty payload, which the relay later
    /// recognises as unprocessable.
    pub fn payload(&self) -> Vec<u8> {
        self.prepare().0
    }

    /// Produces the payload bytes together with the reason they are empty,
    /// if they are.
    ///
    /// An envelope that fails to encode is reported the same way as a
    /// snapshot that failed to serialize, so the enqueue path can warn about
    /// both.
    pub fn prepare(&self) -> (Vec<u8>, Option<String>) {
        if let Some(reason) = &self.degraded {
            return (Vec::new(), Some(reason.clone()));
        }
        match self.envelope.encode() {
            Ok(bytes) => (bytes, None),
            Err(e) => (Vec::new(), Some(format!("envelope: {e}"))),
        }
    }
}
