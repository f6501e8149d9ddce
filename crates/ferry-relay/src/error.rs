//! Error types for relay operations.
//!
//! Separates destination failures, which leave an event pending for the next
//! cycle, from store failures, which abandon the whole cycle, and from
//! lifecycle problems in the worker pool.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// Event log access failed during claim, update, or commit.
    #[error("storage error: {message}")]
    StorageError {
        /// Store error message
        message: String,
    },

    /// Destination stream rejected or failed the append.
    #[error("transport error: {message}")]
    TransportError {
        /// Transport error message
        message: String,
    },

    /// Destination did not acknowledge in time.
    #[error("publish timeout after {timeout_ms}ms")]
    Timeout {
        /// Milliseconds waited before giving up
        timeout_ms: u64,
    },

    /// Invalid relay or sink configuration.
    #[error("invalid relay configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown window.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The shutdown window that was exceeded
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the worker
        worker_id: usize,
        /// Join error description
        error: String,
    },
}

impl RelayError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Returns whether the next cycle may succeed where this one failed.
    ///
    /// Transport and storage failures are transient. Configuration and
    /// lifecycle errors need an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageError { .. } | Self::TransportError { .. } | Self::Timeout { .. } => true,

            Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}

impl From<ferry_core::CoreError> for RelayError {
    fn from(err: ferry_core::CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// Category of relay error for structured log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Event log access.
    Storage,
    /// Destination stream.
    Transport,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle.
    Lifecycle,
}

impl From<&RelayError> for ErrorCategory {
    fn from(error: &RelayError) -> Self {
        match error {
            RelayError::StorageError { .. } => Self::Storage,
            RelayError::TransportError { .. } | RelayError::Timeout { .. } => Self::Transport,
            RelayError::ConfigurationError { .. } => Self::Configuration,
            RelayError::ShutdownTimeout { .. } | RelayError::WorkerPanic { .. } => Self::Lifecycle,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Transport => write!(f, "transport"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
        }
    }
}
