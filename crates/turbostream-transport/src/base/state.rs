//! Protocol-independent transport state: counters, buffer and listeners.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use turbostream_transport_traits::{
    BufferStrategy, ErrorContext, LatencyWindow, ListenerRegistry, MessageBuffer, StreamEvent,
    TransportConfig, TransportError, TransportEvent, TransportMetrics, TransportProtocol,
    TransportState,
};

struct CoreState {
    state: TransportState,
    attempts: u32,
    generation: u64,
    connection: Option<CancellationToken>,
    connected_at: Option<Instant>,
    sent: u64,
    received: u64,
    errors: u64,
    latency: LatencyWindow,
    last_error: Option<TransportError>,
    reconnect_delay: Duration,
}

struct BufferState {
    buffer: MessageBuffer<StreamEvent>,
    backpressure: bool,
}

enum PushOutcome {
    Accepted(Option<TransportEvent>),
    Refused,
    Blocked(StreamEvent),
}

/// State shared by every protocol driver of one transport.
///
/// Locks are held only for short synchronous sections and are released
/// before any listener runs. The exception is `lifecycle`, which orders every
/// emission against the terminal `Closed` event.
pub(crate) struct TransportCore {
    id: Arc<str>,
    protocol: TransportProtocol,
    config: Arc<TransportConfig>,
    state: Mutex<CoreState>,
    buffer: Mutex<BufferState>,
    listeners: ListenerRegistry<TransportEvent>,
    shutdown: CancellationToken,
    paused: AtomicBool,
    draining: AtomicBool,
    space: Notify,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: ReentrantMutex<()>,
}

impl TransportCore {
    pub(crate) fn new(id: String, protocol: TransportProtocol, config: TransportConfig) -> Self {
        let buffer = MessageBuffer::from_config(&config.buffer);
        let reconnect_delay = config.reconnect.initial_delay;
        Self {
            id: Arc::from(id),
            protocol,
            config: Arc::new(config),
            state: Mutex::new(CoreState {
                state: TransportState::Idle,
                attempts: 0,
                generation: 0,
                connection: None,
                connected_at: None,
                sent: 0,
                received: 0,
                errors: 0,
                latency: LatencyWindow::new(),
                last_error: None,
                reconnect_delay,
            }),
            buffer: Mutex::new(BufferState {
                buffer,
                backpressure: false,
            }),
            listeners: ListenerRegistry::new(),
            shutdown: CancellationToken::new(),
            paused: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            space: Notify::new(),
            reconnect_task: Mutex::new(None),
            lifecycle: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn shared_id(&self) -> Arc<str> {
        Arc::clone(&self.id)
    }

    pub(crate) fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub(crate) fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub(crate) fn listeners(&self) -> &ListenerRegistry<TransportEvent> {
        &self.listeners
    }

    // ===== State machine =====

    pub(crate) fn state(&self) -> TransportState {
        self.state.lock().state
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub(crate) fn reset_attempts(&self) {
        self.state.lock().attempts = 0;
    }

    /// Moves to `next` unless closed. Returns whether the transition happened.
    pub(crate) fn set_state(&self, next: TransportState) -> bool {
        let mut state = self.state.lock();
        if state.state.is_terminal() {
            return false;
        }
        state.state = next;
        true
    }

    /// Starts a connection attempt: `(generation, attempt, connection token)`.
    pub(crate) fn begin_attempt(&self) -> Option<(u64, u32, CancellationToken)> {
        let mut state = self.state.lock();
        if state.state.is_terminal() {
            return None;
        }
        if let Some(previous) = state.connection.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        state.state = TransportState::Connecting;
        state.generation += 1;
        state.connection = Some(token.clone());
        Some((state.generation, state.attempts, token))
    }

    /// Records a successful handshake for `generation`.
    pub(crate) fn mark_connected(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.state.is_terminal() || state.generation != generation {
            return false;
        }
        state.state = TransportState::Connected;
        state.attempts = 0;
        state.connected_at = Some(Instant::now());
        true
    }

    /// Retires `generation` after a failure. Returns `false` when it was already stale.
    pub(crate) fn invalidate(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.state.is_terminal() || state.generation != generation {
            return false;
        }
        state.generation += 1;
        state.connected_at = None;
        if let Some(token) = state.connection.take() {
            token.cancel();
        }
        true
    }

    /// Whether reports from `generation` should still be honored.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        !state.state.is_terminal() && state.generation == generation
    }

    /// Counts the next retry and computes its delay.
    pub(crate) fn begin_retry(&self) -> Option<(u32, Duration)> {
        let mut state = self.state.lock();
        if state.state.is_terminal() {
            return None;
        }
        state.attempts += 1;
        state.state = TransportState::Reconnecting;
        let delay = self
            .config
            .reconnect
            .delay_from(state.reconnect_delay, state.attempts);
        Some((state.attempts, delay))
    }

    /// Terminal transition. Returns `false` when already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.state.is_terminal() {
                return false;
            }
            state.state = TransportState::Closed;
            state.generation += 1;
            state.connected_at = None;
            state.connection = None;
        }
        self.shutdown.cancel();
        true
    }

    pub(crate) fn store_reconnect_task(&self, handle: JoinHandle<()>) {
        if self.shutdown.is_cancelled() {
            handle.abort();
            return;
        }
        *self.reconnect_task.lock() = Some(handle);
    }

    pub(crate) fn abort_reconnect_task(&self) {
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
        }
    }

    // ===== Counters =====

    pub(crate) fn record_error(&self, error: TransportError) {
        let context = {
            let mut state = self.state.lock();
            state.errors += 1;
            state.last_error = Some(error.clone());
            ErrorContext::new(error, state.state, state.attempts)
        };
        warn!(
            transport_id = %self.id,
            state = %context.state,
            attempt = context.attempt,
            "Transport error: {}",
            context.error
        );
        self.emit(TransportEvent::Error(context));
    }

    pub(crate) fn record_sent(&self, latency: Option<Duration>) {
        let mut state = self.state.lock();
        state.sent += 1;
        if let Some(sample) = latency {
            state.latency.record(sample);
        }
    }

    pub(crate) fn record_latency(&self, sample: Duration) {
        self.state.lock().latency.record(sample);
    }

    pub(crate) fn set_reconnect_delay(&self, delay: Duration) {
        debug!(transport_id = %self.id, "Server suggested retry interval {:?}", delay);
        self.state.lock().reconnect_delay = delay;
    }

    pub(crate) fn metrics(&self) -> TransportMetrics {
        let buffer_size = self.buffer.lock().buffer.size();
        let state = self.state.lock();
        TransportMetrics {
            transport_id: self.id.to_string(),
            protocol: self.protocol,
            state: state.state,
            connection_duration: state.connected_at.map(|at| at.elapsed()),
            messages_sent: state.sent,
            messages_received: state.received,
            errors: state.errors,
            reconnect_attempts: state.attempts,
            buffer_size,
            average_latency_ms: state.latency.mean_ms(),
            last_error: state.last_error.as_ref().map(ToString::to_string),
        }
    }

    // ===== Events =====

    /// Held across a close so that no other event can be emitted between the
    /// terminal transition and `Closed`. Reentrant for listeners that close.
    pub(crate) fn lifecycle(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lifecycle.lock()
    }

    /// Notifies listeners. Once closed, only the `Closed` event gets through.
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _lifecycle = self.lifecycle.lock();
        if self.state().is_terminal() && !matches!(event, TransportEvent::Closed) {
            return;
        }
        if self.config.debug {
            debug!(transport_id = %self.id, protocol = %self.protocol, "Emitting {:?}", event);
        }
        self.listeners.emit(&event);
    }

    // ===== Buffer pipeline =====

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn is_high_water(&self) -> bool {
        self.buffer.lock().buffer.is_high_water()
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.drain();
        self.space.notify_waiters();
    }

    pub(crate) fn clear_buffer(&self) {
        {
            let mut buffer = self.buffer.lock();
            buffer.buffer.clear();
            buffer.backpressure = false;
        }
        self.space.notify_waiters();
    }

    fn push(&self, event: StreamEvent) -> PushOutcome {
        let mut state = self.buffer.lock();
        match state.buffer.try_push(event) {
            Ok(()) => {
                let signal = (!state.backpressure && state.buffer.is_high_water()).then(|| {
                    state.backpressure = true;
                    TransportEvent::Backpressure {
                        buffer_size: state.buffer.size(),
                        buffer_limit: state.buffer.capacity(),
                        high_water_mark: state.buffer.high_water_mark(),
                    }
                });
                PushOutcome::Accepted(signal)
            }
            Err(event) if state.buffer.strategy() == BufferStrategy::Block => {
                PushOutcome::Blocked(event)
            }
            Err(_) => PushOutcome::Refused,
        }
    }

    /// Buffers one inbound event and drains unless paused.
    ///
    /// Under the block strategy this waits for space instead of discarding.
    pub(crate) async fn deliver(&self, event: StreamEvent) {
        let mut pending = event;
        loop {
            match self.push(pending) {
                PushOutcome::Accepted(signal) => {
                    if let Some(signal) = signal {
                        self.emit(signal);
                    }
                    break;
                }
                PushOutcome::Refused => {
                    debug!(transport_id = %self.id, "Buffer full, dropped newest event");
                    break;
                }
                PushOutcome::Blocked(event) => {
                    pending = event;
                    let notified = self.space.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !self.is_paused() && self.drain() {
                        continue;
                    }
                    tokio::select! {
                        () = &mut notified => {}
                        () = self.shutdown.cancelled() => return,
                    }
                }
            }
        }
        if !self.is_paused() {
            self.drain();
        }
    }

    /// Empties the buffer into `Message` events. Returns `false` if another
    /// caller was already draining.
    pub(crate) fn drain(&self) -> bool {
        if self.draining.swap(true, Ordering::AcqRel) {
            return false;
        }
        loop {
            while !self.is_paused() {
                let (event, drained) = {
                    let mut state = self.buffer.lock();
                    let Some(event) = state.buffer.shift() else {
                        break;
                    };
                    let drained = state.backpressure && !state.buffer.is_high_water();
                    if drained {
                        state.backpressure = false;
                    }
                    (event, drained)
                };
                self.state.lock().received += 1;
                self.space.notify_waiters();
                self.emit(TransportEvent::Message(event));
                if drained {
                    self.emit(TransportEvent::Drain);
                }
            }
            self.draining.store(false, Ordering::Release);

            // Another producer may have pushed while the guard was held.
            let more = !self.is_paused() && !self.buffer.lock().buffer.is_empty();
            if !more || self.draining.swap(true, Ordering::AcqRel) {
                break;
            }
        }
        true
    }
}
