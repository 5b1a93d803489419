//! Transport error types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::TransportState;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Represents errors that can occur during transport operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Connection establishment did not settle within the per-attempt deadline.
    #[error(
        "Connection timed out after {timeout:?}. \
         If this is expected, increase `TransportConfig::timeout`"
    )]
    ConnectionTimeout {
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The remote endpoint reported an application-level error in-band.
    #[error("Remote error: {message}")]
    Remote {
        /// Message extracted from the error payload
        message: String,
    },

    /// No pong arrived within twice the heartbeat interval.
    #[error("Heartbeat timed out: no pong for {elapsed:?}")]
    HeartbeatTimeout {
        /// Time since the oldest unanswered ping
        elapsed: Duration,
    },

    /// Failed to deliver an outbound payload.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The transport has no usable connection for the operation.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The manager pool is full and nothing could be evicted.
    #[error("Transport pool exhausted: maximum of {max} transports reached")]
    PoolExhausted {
        /// The configured pool limit
        max: usize,
    },

    /// The transport was closed and can no longer be used.
    #[error("Transport is closed")]
    Closed,

    /// An operation was invoked in a state that does not permit it.
    #[error("Cannot {operation} while transport is {state}")]
    InvalidState {
        /// The rejected operation
        operation: &'static str,
        /// The state the transport was in
        state: TransportState,
    },

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Default retry eligibility used by the reconnection algorithm.
    ///
    /// Connection-level faults are retried; caller misuse, configuration
    /// problems and in-band application errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionLost(_)
                | Self::ConnectionTimeout { .. }
                | Self::HeartbeatTimeout { .. }
                | Self::Protocol(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` for errors caused by operating a closed or unstarted transport.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Closed | Self::InvalidState { .. })
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Context attached to every `error` event.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// The error that occurred.
    pub error: TransportError,
    /// Transport state at the time the error was observed.
    pub state: TransportState,
    /// Reconnect attempt counter at the time the error was observed.
    pub attempt: u32,
    /// When the error was observed.
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    /// Creates a context stamped with the current time.
    pub fn new(error: TransportError, state: TransportState, attempt: u32) -> Self {
        Self {
            error,
            state,
            attempt,
            timestamp: Utc::now(),
        }
    }
}
