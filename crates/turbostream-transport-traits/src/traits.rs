//! Core transport traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportResult;
use crate::events::{EventKind, EventListener, ListenerId, TransportEvent};
use crate::metrics::{TransportHealth, TransportMetrics};
use crate::types::{TransportProtocol, TransportState};

/// The contract every streaming transport implements.
///
/// Recoverable faults are reported through [`TransportEvent::Error`] and the
/// state machine; only caller misuse is returned as an `Err`.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Generated identifier, unique per transport.
    fn id(&self) -> &str;

    /// Wire protocol spoken by this transport.
    fn protocol(&self) -> TransportProtocol;

    /// Starts a connection attempt and waits for it to settle.
    ///
    /// Connection failures do not surface here: they are emitted as `error`
    /// events and handed to the reconnection algorithm.
    async fn connect(&self) -> TransportResult<()>;

    /// Writes a payload to the remote, or queues it where the protocol allows.
    async fn send(&self, payload: serde_json::Value) -> TransportResult<()>;

    /// Terminally closes the transport. Idempotent.
    fn close(&self);

    /// Current state.
    fn state(&self) -> TransportState;

    /// Snapshot of the counters.
    fn metrics(&self) -> TransportMetrics;

    /// Health classification derived from the current metrics.
    fn health(&self) -> TransportHealth {
        TransportHealth::from_metrics(&self.metrics())
    }

    /// Returns `true` in the `Connected` state.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Stops draining the buffer; events keep accumulating.
    fn pause(&self);

    /// Resumes draining immediately.
    fn resume(&self);

    /// Returns `true` while paused.
    fn is_paused(&self) -> bool;

    /// Registers a listener for one event category.
    fn on(&self, kind: EventKind, listener: EventListener<TransportEvent>) -> ListenerId;

    /// Registers a listener for every event.
    fn on_any(&self, listener: EventListener<TransportEvent>) -> ListenerId;

    /// Unregisters a listener.
    fn off(&self, id: ListenerId) -> bool;

    /// Opens a channel receiving every subsequent event.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}
