//! Handle through which protocol readers report back to their transport.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use turbostream_transport_traits::{StreamEvent, TransportConfig, TransportError, TransportEvent};

use super::state::TransportCore;

/// Implemented by the transport that owns a connection.
pub(crate) trait ConnectionOwner: Send + Sync {
    fn core(&self) -> &TransportCore;

    fn connection_lost(self: Arc<Self>, generation: u64, error: TransportError);
}

/// Binding between one connection attempt and the transport that started it.
///
/// Every report is tagged with the attempt's generation; once the transport
/// has moved on (reconnected, closed) reports from an old context are ignored.
/// The context holds only a weak reference, so background readers never keep
/// a dropped transport alive.
#[derive(Clone)]
pub struct ConnectionContext {
    owner: Weak<dyn ConnectionOwner>,
    generation: u64,
    token: CancellationToken,
    transport_id: Arc<str>,
    config: Arc<TransportConfig>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("transport_id", &self.transport_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    pub(crate) fn new(
        owner: Weak<dyn ConnectionOwner>,
        generation: u64,
        token: CancellationToken,
        transport_id: Arc<str>,
        config: Arc<TransportConfig>,
    ) -> Self {
        Self {
            owner,
            generation,
            token,
            transport_id,
            config,
        }
    }

    /// Identifier of the owning transport.
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// Configuration of the owning transport.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Connection generation this context reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled when this connection is lost, superseded or the transport closes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once [`token`](Self::token) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns `true` while this connection is the transport's live one.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled()
            && self
                .owner
                .upgrade()
                .is_some_and(|owner| owner.core().is_current(self.generation))
    }

    /// Hands a decoded event to the backpressure pipeline.
    pub async fn deliver(&self, event: StreamEvent) {
        if let Some(owner) = self.current_owner() {
            owner.core().deliver(event).await;
        }
    }

    /// Signals the end of the stream.
    pub fn complete(&self) {
        if let Some(owner) = self.current_owner() {
            info!("Stream {} completed", self.transport_id);
            owner.core().emit(TransportEvent::Done);
        }
    }

    /// Reports a non-fatal error; the connection stays up.
    pub fn report_error(&self, error: TransportError) {
        if let Some(owner) = self.current_owner() {
            owner.core().record_error(error);
        }
    }

    /// Reports that the connection is gone, handing it to the reconnection algorithm.
    pub fn connection_lost(&self, error: TransportError) {
        if let Some(owner) = self.owner.upgrade() {
            owner.connection_lost(self.generation, error);
        }
    }

    /// Counts a payload written on behalf of an earlier queued `send()`.
    pub fn record_sent(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.core().record_sent(None);
        }
    }

    /// Adds a round-trip sample to the latency window.
    pub fn record_latency(&self, sample: Duration) {
        if let Some(owner) = self.owner.upgrade() {
            owner.core().record_latency(sample);
        }
    }

    /// Replaces the base reconnect delay with a server-suggested one.
    pub fn set_reconnect_delay(&self, delay: Duration) {
        if let Some(owner) = self.current_owner() {
            owner.core().set_reconnect_delay(delay);
        }
    }

    /// Returns `true` when the buffer is at or above its high-water mark.
    pub fn is_high_water(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.core().is_high_water())
    }

    /// Returns `true` while the consumer has paused delivery.
    pub fn is_paused(&self) -> bool {
        self.owner
            .upgrade()
            .is_some_and(|owner| owner.core().is_paused())
    }

    fn current_owner(&self) -> Option<Arc<dyn ConnectionOwner>> {
        if self.token.is_cancelled() {
            return None;
        }
        self.owner
            .upgrade()
            .filter(|owner| owner.core().is_current(self.generation))
    }
}
