//! Seam between the shared state machine and a wire protocol.

use std::fmt;

use async_trait::async_trait;

use turbostream_transport_traits::{TransportConfig, TransportResult, TransportState};

use super::context::ConnectionContext;

/// What a driver did with an outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the remote.
    Sent,
    /// Held until the connection returns.
    Queued,
}

/// Protocol-specific half of a transport.
///
/// [`BaseTransport`](super::BaseTransport) owns state, retries, buffering and
/// events; a driver only moves bytes. A driver must not hold locks across
/// calls into the [`ConnectionContext`].
#[async_trait]
pub trait ProtocolDriver: Send + Sync + fmt::Debug + 'static {
    /// Performs the handshake. Runs under the per-attempt deadline and is
    /// aborted when the deadline passes or the transport closes.
    async fn open(&self, ctx: &ConnectionContext) -> TransportResult<()>;

    /// Called once the transport is `Connected`: start readers, timers, flush queues.
    async fn on_connected(&self, ctx: &ConnectionContext);

    /// Writes (or queues) one payload. `state` is the transport state at call time.
    async fn send(
        &self,
        config: &TransportConfig,
        state: TransportState,
        payload: serde_json::Value,
    ) -> TransportResult<SendOutcome>;

    /// Drops readers, sockets and timers of the current connection.
    fn release(&self);

    /// Final teardown. Also discards anything waiting to be sent.
    fn close(&self) {
        self.release();
    }
}
