//! WebSocket transport.
//!
//! Frames carry JSON objects with a `type` discriminator: `done` completes
//! the stream, `error` is reported as a remote error, `ping` is answered with
//! a pong before being delivered and `pong` feeds the heartbeat. Payloads sent while disconnected are queued and
//! flushed in order after the next successful connect.

mod frames;
mod heartbeat;
mod transport;

pub use transport::{WebSocketDriver, WebSocketTransport};
