//! Core transport types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Enumerates the wire protocols a transport can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportProtocol {
    /// Server-Sent Events over a long-lived HTTP response.
    Sse,
    /// Full-duplex WebSocket.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Newline-delimited JSON over a chunked HTTP body, with long-poll fallback.
    HttpStream,
}

impl TransportProtocol {
    /// All protocols, in registration order.
    pub const ALL: [Self; 3] = [Self::Sse, Self::WebSocket, Self::HttpStream];

    /// The canonical tag for this protocol.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
            Self::HttpStream => "http-stream",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sse" | "event-stream" => Ok(Self::Sse),
            "websocket" | "ws" => Ok(Self::WebSocket),
            "http-stream" | "http" | "ndjson" => Ok(Self::HttpStream),
            other => Err(TransportError::Configuration(format!(
                "unknown transport protocol '{other}'"
            ))),
        }
    }
}

/// Represents the current state of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Constructed, no connection attempted yet.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and ready to stream.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Reconnection gave up; waits for the caller to reconnect or close.
    Error,
    /// Closed by the caller. Terminal.
    Closed,
}

impl TransportState {
    /// Returns `true` once the transport has been closed.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
            Self::Closed => write!(f, "closed"),
        }
    }
}
