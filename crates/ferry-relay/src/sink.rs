//! Destination stream sinks.
//!
//! The relay appends each event's raw payload to the stream named by its
//! topic. The only response shapes are an acknowledgment or an error; the
//! relay does not deduplicate, so consumers see at-least-once delivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};

use crate::error::{RelayError, Result};

/// Stream entry field holding the event payload.
pub const PAYLOAD_FIELD: &str = "payload";

/// Acknowledgment returned by a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Stream-assigned entry id, when the sink reports one.
    pub entry_id: Option<String>,
}

/// Append-only destination addressed by topic.
#[async_trait]
pub trait StreamSink: Send + Sync + std::fmt::Debug {
    /// Appends `payload` to the stream named `topic`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::TransportError` or `RelayError::Timeout` when the
    /// destination does not acknowledge the append, and
    /// `RelayError::ConfigurationError` once the sink has been closed.
    async fn append(&self, topic: &str, payload: Bytes) -> Result<DeliveryReceipt>;

    /// Releases the destination connection. Called once on engine shutdown.
    async fn close(&self) {}
}

/// Connection settings for the Redis stream sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Redis connection URL.
    pub url: String,
    /// Approximate maximum retained entries per stream (`MAXLEN ~`).
    pub max_len: usize,
    /// Upper bound for connecting and for each append.
    pub timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_len: crate::DEFAULT_STREAM_MAX_LEN,
            timeout: Duration::from_millis(crate::DEFAULT_PUBLISH_TIMEOUT_MS),
        }
    }
}

/// Sink appending to Redis streams with `XADD ... MAXLEN ~`.
///
/// Owns a single multiplexed connection that reconnects on its own after
/// transport failures. One sink belongs to one relay engine. Clones share the
/// connection, and `close` drops it for all of them.
#[derive(Clone)]
pub struct RedisStreamSink {
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    config: SinkConfig,
}

impl std::fmt::Debug for RedisStreamSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamSink").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RedisStreamSink {
    /// Connects to the destination.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for an invalid URL and
    /// `TransportError`/`Timeout` if the server cannot be reached.
    pub async fn connect(config: SinkConfig) -> Result<Self> {
        if config.max_len == 0 {
            return Err(RelayError::configuration("stream max_len must be greater than 0"));
        }

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| RelayError::configuration(format!("invalid redis url: {e}")))?;

        let connection = tokio::time::timeout(config.timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RelayError::timeout(config.timeout))?
            .map_err(|e| RelayError::transport(format!("failed to connect to redis: {e}")))?;

        Ok(Self { connection: Arc::new(RwLock::new(Some(connection))), config })
    }

    async fn xadd(
        &self,
        mut connection: ConnectionManager,
        topic: &str,
        payload: &[u8],
    ) -> redis::RedisResult<String> {
        redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut connection)
            .await
    }
}

#[async_trait]
impl StreamSink for RedisStreamSink {
    async fn append(&self, topic: &str, payload: Bytes) -> Result<DeliveryReceipt> {
        let Some(connection) = self.connection.read().await.clone() else {
            return Err(RelayError::configuration("redis stream sink is closed"));
        };
        let span = info_span!("stream_append", topic, payload_size = payload.len());

        let entry_id =
            tokio::time::timeout(self.config.timeout, self.xadd(connection, topic, &payload))
                .instrument(span)
                .await
                .map_err(|_| RelayError::timeout(self.config.timeout))?
                .map_err(|e| RelayError::transport(format!("XADD to {topic} failed: {e}")))?;

        Ok(DeliveryReceipt { entry_id: Some(entry_id) })
    }

    async fn close(&self) {
        if self.connection.write().await.take().is_some() {
            debug!(max_len = self.config.max_len, "closed redis stream sink");
        }
    }
}

pub mod mock {
    //! In-memory sink for testing.
    //!
    //! Records every append and can be switched into a failing mode to
    //! simulate an unreachable destination.

    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::{DeliveryReceipt, StreamSink};
    use crate::error::{RelayError, Result};

    /// A recorded append.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Append {
        /// Destination topic.
        pub topic: String,
        /// Raw payload as received.
        pub payload: Bytes,
    }

    /// Sink that records appends in memory.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        appends: Mutex<Vec<Append>>,
        attempts: Mutex<usize>,
        failing: AtomicBool,
        closed: AtomicBool,
        latency: Mutex<Option<Duration>>,
    }

    impl RecordingSink {
        /// Creates an empty, healthy sink.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes subsequent appends fail (`true`) or succeed (`false`).
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Delays every append, to widen race windows in concurrency tests.
        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = Some(latency);
        }

        /// Successful appends in arrival order.
        pub fn appends(&self) -> Vec<Append> {
            self.appends.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }

        /// Number of successful appends.
        pub fn append_count(&self) -> usize {
            self.appends.lock().unwrap_or_else(|p| p.into_inner()).len()
        }

        /// Number of append calls, failed ones included.
        pub fn attempt_count(&self) -> usize {
            *self.attempts.lock().unwrap_or_else(|p| p.into_inner())
        }

        /// Returns whether `close` has been called.
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamSink for RecordingSink {
        async fn append(&self, topic: &str, payload: Bytes) -> Result<DeliveryReceipt> {
            *self.attempts.lock().unwrap_or_else(|p| p.into_inner()) += 1;

            let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(RelayError::configuration("recording sink is closed"));
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(RelayError::transport(format!("stream {topic} unavailable")));
            }

            let mut appends = self.appends.lock().unwrap_or_else(|p| p.into_inner());
            appends.push(Append { topic: topic.to_string(), payload });
            Ok(DeliveryReceipt { entry_id: Some(format!("{}-0", appends.len())) })
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
