//! Shared transport state machine.
//!
//! [`BaseTransport`] implements the lifecycle every protocol shares:
//!
//! ```text
//! idle --connect()--> connecting --ok--> connected --loss--> reconnecting --> connecting ...
//!                          \--fail (retries left)--> reconnecting
//!                          \--fail (exhausted)-----> error
//! any --close()--> closed (terminal)
//! ```
//!
//! The wire protocol is supplied by a [`ProtocolDriver`].

mod context;
mod driver;
mod state;

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use turbostream_transport_traits::{
    EventKind, EventListener, ListenerId, Transport, TransportConfig, TransportError,
    TransportEvent, TransportMetrics, TransportProtocol, TransportResult, TransportState,
};

pub use context::ConnectionContext;
pub use driver::{ProtocolDriver, SendOutcome};

use self::context::ConnectionOwner;
use self::state::TransportCore;

struct Shared<D> {
    core: TransportCore,
    driver: D,
}

impl<D: ProtocolDriver> ConnectionOwner for Shared<D> {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    fn connection_lost(self: Arc<Self>, generation: u64, error: TransportError) {
        if !self.core.invalidate(generation) {
            debug!(
                "Ignoring loss report from stale connection of {}: {}",
                self.core.id(),
                error
            );
            return;
        }
        warn!("Connection of {} lost: {}", self.core.id(), error);
        self.driver.release();
        self.handle_failure(error);
    }
}

impl<D: ProtocolDriver> Shared<D> {
    /// One connection attempt, from `connecting` until it settles.
    fn attempt_connect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some((generation, attempt, token)) = self.core.begin_attempt() else {
                return;
            };
            self.core.emit(TransportEvent::Connecting { attempt });
            debug!(
                "Connecting {} to {} (attempt {})",
                self.core.id(),
                self.core.config().endpoint,
                attempt
            );

            let owner: Weak<dyn ConnectionOwner> = Arc::<Self>::downgrade(&self);
            let ctx = ConnectionContext::new(
                owner,
                generation,
                token,
                self.core.shared_id(),
                Arc::clone(self.core.config()),
            );

            let timeout = self.core.config().timeout;
            let result = tokio::select! {
                () = ctx.cancelled() => {
                    self.driver.release();
                    return;
                }
                result = tokio::time::timeout(timeout, self.driver.open(&ctx)) => {
                    result.unwrap_or(Err(TransportError::ConnectionTimeout { timeout }))
                }
            };

            match result {
                Ok(()) => {
                    if !self.core.mark_connected(generation) {
                        self.driver.release();
                        return;
                    }
                    info!(
                        "{} connected to {}",
                        self.core.id(),
                        self.core.config().endpoint
                    );
                    self.core.emit(TransportEvent::Connected);
                    if ctx.is_current() {
                        self.driver.on_connected(&ctx).await;
                    }
                }
                Err(error) => {
                    if !self.core.invalidate(generation) {
                        self.driver.release();
                        return;
                    }
                    self.driver.release();
                    self.handle_failure(error);
                }
            }
        })
    }

    /// Records `error` and either schedules a retry or settles in `error`.
    fn handle_failure(self: &Arc<Self>, error: TransportError) {
        let attempt = self.core.attempts();
        self.core.record_error(error.clone());

        let config = self.core.config();
        let policy = &config.reconnect;
        let eligible = match &config.should_retry {
            Some(predicate) => predicate.should_retry(&error, attempt),
            None => error.is_retryable(),
        };

        if !(policy.enabled && eligible && attempt < policy.max_attempts) {
            if self.core.set_state(TransportState::Error) {
                error!(
                    "{} giving up after {} reconnect attempts: {}",
                    self.core.id(),
                    attempt,
                    error
                );
            }
            return;
        }

        let Some((next, delay)) = self.core.begin_retry() else {
            return;
        };
        warn!(
            "Reconnecting {} in {:?} (attempt {}/{})",
            self.core.id(),
            delay,
            next,
            policy.max_attempts
        );
        self.core.emit(TransportEvent::Reconnecting {
            attempt: next,
            delay,
            max_attempts: policy.max_attempts,
        });

        // A listener may have closed the transport while handling the event.
        if self.core.state() != TransportState::Reconnecting {
            return;
        }

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.attempt_connect().await;
            }
        });
        self.core.store_reconnect_task(handle);
    }

    fn close(&self) {
        let _lifecycle = self.core.lifecycle();
        if !self.core.mark_closed() {
            return;
        }
        self.core.abort_reconnect_task();
        self.driver.close();
        self.core.clear_buffer();
        info!("{} closed", self.core.id());
        self.core.emit(TransportEvent::Closed);
    }
}

/// A transport: the shared state machine driven by a protocol driver.
pub struct BaseTransport<D: ProtocolDriver> {
    shared: Arc<Shared<D>>,
}

impl<D: ProtocolDriver> fmt::Debug for BaseTransport<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseTransport")
            .field("id", &self.shared.core.id())
            .field("protocol", &self.shared.core.protocol())
            .field("state", &self.shared.core.state())
            .field("driver", &self.shared.driver)
            .finish()
    }
}

impl<D: ProtocolDriver> BaseTransport<D> {
    /// Builds a transport around `driver`. Fails on an invalid configuration.
    pub fn with_driver(
        protocol: TransportProtocol,
        config: TransportConfig,
        driver: D,
    ) -> TransportResult<Self> {
        config.validate()?;
        let id = format!("{protocol}-{}", Uuid::new_v4());
        Ok(Self {
            shared: Arc::new(Shared {
                core: TransportCore::new(id, protocol, config),
                driver,
            }),
        })
    }

    /// The configuration this transport was built with.
    pub fn config(&self) -> &TransportConfig {
        self.shared.core.config()
    }

    /// The protocol driver.
    pub fn driver(&self) -> &D {
        &self.shared.driver
    }
}

impl<D: ProtocolDriver> Drop for BaseTransport<D> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[async_trait]
impl<D: ProtocolDriver> Transport for BaseTransport<D> {
    fn id(&self) -> &str {
        self.shared.core.id()
    }

    fn protocol(&self) -> TransportProtocol {
        self.shared.core.protocol()
    }

    async fn connect(&self) -> TransportResult<()> {
        match self.shared.core.state() {
            TransportState::Closed => return Err(TransportError::Closed),
            TransportState::Connected | TransportState::Connecting => return Ok(()),
            TransportState::Idle | TransportState::Reconnecting | TransportState::Error => {}
        }
        // A caller-initiated connect supersedes any scheduled retry.
        self.shared.core.abort_reconnect_task();
        self.shared.core.reset_attempts();
        Arc::clone(&self.shared).attempt_connect().await;
        Ok(())
    }

    async fn send(&self, payload: serde_json::Value) -> TransportResult<()> {
        let state = self.shared.core.state();
        match state {
            TransportState::Closed => return Err(TransportError::Closed),
            TransportState::Idle => {
                return Err(TransportError::InvalidState {
                    operation: "send",
                    state,
                });
            }
            TransportState::Error => {
                return Err(TransportError::NotConnected(
                    "reconnection gave up; call connect() to retry".to_string(),
                ));
            }
            TransportState::Connecting
            | TransportState::Connected
            | TransportState::Reconnecting => {}
        }

        let started = Instant::now();
        match self
            .shared
            .driver
            .send(self.shared.core.config(), state, payload)
            .await
        {
            Ok(SendOutcome::Sent) => {
                self.shared.core.record_sent(Some(started.elapsed()));
                Ok(())
            }
            Ok(SendOutcome::Queued) => {
                debug!("{} queued payload while {}", self.shared.core.id(), state);
                Ok(())
            }
            Err(error) => {
                if !error.is_misuse() {
                    self.shared.core.record_error(error.clone());
                }
                Err(error)
            }
        }
    }

    fn close(&self) {
        self.shared.close();
    }

    fn state(&self) -> TransportState {
        self.shared.core.state()
    }

    fn metrics(&self) -> TransportMetrics {
        self.shared.core.metrics()
    }

    fn pause(&self) {
        self.shared.core.pause();
    }

    fn resume(&self) {
        self.shared.core.resume();
    }

    fn is_paused(&self) -> bool {
        self.shared.core.is_paused()
    }

    fn on(&self, kind: EventKind, listener: EventListener<TransportEvent>) -> ListenerId {
        self.shared.core.listeners().on(kind, listener)
    }

    fn on_any(&self, listener: EventListener<TransportEvent>) -> ListenerId {
        self.shared.core.listeners().on_any(listener)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.shared.core.listeners().off(id)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.shared.core.listeners().subscribe()
    }
}
