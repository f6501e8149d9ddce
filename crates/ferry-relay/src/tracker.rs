//! Per-event status state machine.
//!
//! Pure decision logic, independent of the poll loop and of time, so retry
//! and poison behaviour can be exercised directly:
//!
//! ```text
//! pending ──delivery succeeded──▶ published            (terminal)
//! pending ──delivery failed─────▶ pending, retry + 1
//! pending ──payload unparsable──▶ published            (terminal, no delivery)
//! ```

use std::fmt;

use ferry_core::{EventStatus, OutboxEvent, PayloadSummary};

/// What happened to an event during one relay cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// The sink acknowledged the append.
    DeliverySucceeded,
    /// The sink returned an error or timed out.
    DeliveryFailed,
    /// The stored payload is not well-formed JSON; no delivery attempted.
    PayloadUnparsable,
}

/// Resulting state change to persist in the claim transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Delivered; becomes `published`.
    Published,
    /// Delivery failed; stays `pending` with the new retry count.
    Retried {
        /// Retry count after this failure.
        retry_count: i32,
    },
    /// Unprocessable payload; becomes `published` without delivery.
    Poisoned,
}

impl Transition {
    /// Status the event has after this transition.
    pub const fn status(self) -> EventStatus {
        match self {
            Self::Published | Self::Poisoned => EventStatus::Published,
            Self::Retried { .. } => EventStatus::Pending,
        }
    }
}

/// Attempted a transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the event was in.
    pub from: EventStatus,
    /// Input that was rejected.
    pub input: Input,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {} on {:?}", self.from, self.input)
    }
}

impl std::error::Error for InvalidTransition {}

/// Computes the next state for an event currently in `status` with
/// `retry_count` failed attempts.
///
/// # Errors
///
/// Returns `InvalidTransition` for any input on a `published` event.
pub fn next(
    status: EventStatus,
    retry_count: i32,
    input: Input,
) -> Result<Transition, InvalidTransition> {
    if status.is_terminal() {
        return Err(InvalidTransition { from: status, input });
    }

    Ok(match input {
        Input::DeliverySucceeded => Transition::Published,
        Input::DeliveryFailed => Transition::Retried { retry_count: retry_count.saturating_add(1) },
        Input::PayloadUnparsable => Transition::Poisoned,
    })
}

/// Result of inspecting a stored payload before delivery.
#[derive(Debug)]
pub enum PayloadCheck {
    /// Well-formed JSON; deliver the raw bytes.
    Deliverable(PayloadSummary),
    /// Not well-formed JSON; the event is a poison message.
    Unparsable(String),
}

/// Decides whether an event's payload can be delivered.
///
/// Only malformed JSON is poison. Payloads that parse but do not match the
/// current envelope shape are delivered unchanged.
pub fn inspect(event: &OutboxEvent) -> PayloadCheck {
    match PayloadSummary::read(&event.payload) {
        Ok(summary) => PayloadCheck::Deliverable(summary),
        Err(e) => PayloadCheck::Unparsable(e.to_string()),
    }
}
