//! Relay outcome events.
//!
//! Workers emit one [`RelayEvent`] per settled event after the claim
//! transaction commits, so subscribers only ever observe durable outcomes.
//! Handlers must not block relay progress; failures inside a handler are
//! the handler's own concern.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferry_core::EventId;
use serde::{Deserialize, Serialize};

/// Outcome of one event in a committed relay cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayEvent {
    /// Appended to its stream and marked published.
    Published(EventPublished),

    /// Delivery failed; the event stays pending.
    Retried(EventRetried),

    /// Payload could not be decoded; marked published without delivery.
    Poisoned(EventPoisoned),
}

impl RelayEvent {
    /// Id of the event this outcome concerns.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Published(e) => e.event_id,
            Self::Retried(e) => e.event_id,
            Self::Poisoned(e) => e.event_id,
        }
    }
}

/// Emitted when an event is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPublished {
    /// Event id.
    pub event_id: EventId,
    /// Destination stream.
    pub topic: String,
    /// Entry id assigned by the stream, if reported.
    pub stream_entry_id: Option<String>,
    /// Commit timestamp recorded on the row.
    pub published_at: DateTime<Utc>,
    /// Worker that delivered the event.
    pub worker_id: usize,
}

/// Emitted when delivery fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRetried {
    /// Event id.
    pub event_id: EventId,
    /// Destination stream.
    pub topic: String,
    /// Retry count after this failure.
    pub retry_count: i32,
    /// Delivery error.
    pub error_message: String,
    /// Worker that attempted delivery.
    pub worker_id: usize,
}

/// Emitted when a payload is unprocessable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPoisoned {
    /// Event id.
    pub event_id: EventId,
    /// Destination stream that was never written.
    pub topic: String,
    /// Decode error.
    pub reason: String,
    /// Worker that settled the event.
    pub worker_id: usize,
}

/// Subscriber for relay outcomes.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one outcome.
    async fn handle_event(&self, event: RelayEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: RelayEvent) {}
}

/// Forwards each event to every subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: RelayEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

pub mod mock {
    //! Handler that records every event for assertions.

    use std::sync::Mutex;

    use super::{EventHandler, RelayEvent};

    /// Collects events in arrival order.
    #[derive(Debug, Default)]
    pub struct RecordingEventHandler {
        events: Mutex<Vec<RelayEvent>>,
    }

    impl RecordingEventHandler {
        /// Creates an empty recorder.
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of recorded events.
        pub fn events(&self) -> Vec<RelayEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        /// Number of recorded poison outcomes.
        pub fn poisoned_count(&self) -> usize {
            self.events().iter().filter(|e| matches!(e, RelayEvent::Poisoned(_))).count()
        }
    }

    #[async_trait::async_trait]
    impl EventHandler for RecordingEventHandler {
        async fn handle_event(&self, event: RelayEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }
}
