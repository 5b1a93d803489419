//! Shared test doubles and event helpers.

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as channel;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use turbostream_transport::network::{
    HttpClient, HttpRequest, HttpResponse, HttpStream, SocketConnection, SocketConnector,
    SocketFrame, SocketRequest, SocketSink,
};
use turbostream_transport::{
    EventKind, EventListener, ListenerId, ListenerRegistry, Transport, TransportError,
    TransportEvent, TransportMetrics, TransportProtocol, TransportResult, TransportState,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Waits for the first event matching `pred`, discarding the others.
pub async fn next_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    mut pred: F,
) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collects events up to and including the first one matching `pred`.
pub async fn collect_until<F>(
    rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    mut pred: F,
) -> Vec<TransportEvent>
where
    F: FnMut(&TransportEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event channel closed");
            let stop = pred(&event);
            events.push(event);
            if stop {
                return events;
            }
        }
    })
    .await
    .expect("timed out collecting events")
}

/// Everything already queued on the receiver.
pub fn drain<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub async fn wait_for_state(transport: &dyn Transport, state: TransportState) {
    tokio::time::timeout(WAIT, async {
        while transport.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transport never reached {state}, still {}", transport.state()));
}

pub fn is_done(event: &TransportEvent) -> bool {
    matches!(event, TransportEvent::Done)
}

/// Payloads of the `Message` events, in order.
pub fn messages(events: &[TransportEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::Message(message) => Some(message.data.clone()),
            _ => None,
        })
        .collect()
}

pub fn count(events: &[TransportEvent], kind: EventKind) -> usize {
    use turbostream_transport::Categorized;
    events.iter().filter(|event| event.kind() == kind).count()
}

/// HTTP client whose every request fails to connect.
#[derive(Debug, Default)]
pub struct RefusingHttpClient {
    pub calls: AtomicUsize,
}

#[async_trait]
impl HttpClient for RefusingHttpClient {
    async fn open_stream(&self, _request: HttpRequest) -> TransportResult<HttpStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::ConnectionFailed("connection refused".into()))
    }

    async fn request(&self, _request: HttpRequest) -> TransportResult<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::ConnectionFailed("connection refused".into()))
    }
}

/// HTTP client whose requests never answer.
#[derive(Debug, Default)]
pub struct HangingHttpClient;

#[async_trait]
impl HttpClient for HangingHttpClient {
    async fn open_stream(&self, _request: HttpRequest) -> TransportResult<HttpStream> {
        futures::future::pending().await
    }

    async fn request(&self, _request: HttpRequest) -> TransportResult<HttpResponse> {
        futures::future::pending().await
    }
}

/// Server half of an in-memory socket.
pub struct ServerSocket {
    pub request: SocketRequest,
    pub to_client: channel::UnboundedSender<TransportResult<SocketFrame>>,
    pub from_client: channel::UnboundedReceiver<SocketFrame>,
}

impl ServerSocket {
    pub fn send_text(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(SocketFrame::Text(text.to_string())))
            .expect("client reader gone");
    }

    /// Next frame the client wrote, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.from_client.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client writer gone");
        match frame {
            SocketFrame::Text(text) => serde_json::from_str(&text).expect("client sent JSON"),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

/// Client write half that never accepts a frame.
struct StalledSink;

impl Sink<SocketFrame> for StalledSink {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: SocketFrame) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Connector handing each accepted socket to the test.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerSocket>,
    /// Handshakes to refuse before accepting again.
    pub refuse: AtomicUsize,
    /// Accepted sockets whose client writes never complete.
    pub stall: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSocket>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            refuse: AtomicUsize::new(0),
            stall: AtomicUsize::new(0),
        });
        (connector, rx)
    }
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketConnection> {
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed("handshake refused".into()));
        }

        let stalled = self
            .stall
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let (client_tx, server_rx) = channel::unbounded::<SocketFrame>();
        let (server_tx, client_rx) = channel::unbounded::<TransportResult<SocketFrame>>();
        let _ = self.accepted.send(ServerSocket {
            request,
            to_client: server_tx,
            from_client: server_rx,
        });
        let sink: SocketSink = if stalled {
            Box::pin(StalledSink)
        } else {
            Box::pin(client_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string())))
        };
        Ok(SocketConnection {
            sink,
            stream: client_rx.boxed(),
            protocol: None,
        })
    }
}

/// Transport whose state and traffic are set by the test.
#[derive(Debug)]
pub struct FakeTransport {
    id: String,
    state: Mutex<TransportState>,
    traffic: AtomicU64,
    connected_for: Mutex<Option<Duration>>,
    listeners: ListenerRegistry<TransportEvent>,
}

impl FakeTransport {
    pub fn new(id: &str, state: TransportState) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(state),
            traffic: AtomicU64::new(0),
            connected_for: Mutex::new(None),
            listeners: ListenerRegistry::new(),
        })
    }

    pub fn with_traffic(self: Arc<Self>, messages: u64) -> Arc<Self> {
        self.traffic.store(messages, Ordering::SeqCst);
        self
    }

    pub fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    pub fn set_connected_for(&self, duration: Duration) {
        *self.connected_for.lock() = Some(duration);
    }

    pub fn emit(&self, event: TransportEvent) {
        self.listeners.emit(&event);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Sse
    }

    async fn connect(&self) -> TransportResult<()> {
        self.set_state(TransportState::Connected);
        Ok(())
    }

    async fn send(&self, _payload: Value) -> TransportResult<()> {
        self.traffic.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), TransportState::Closed);
        if previous != TransportState::Closed {
            self.emit(TransportEvent::Closed);
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn metrics(&self) -> TransportMetrics {
        TransportMetrics {
            transport_id: self.id.clone(),
            protocol: TransportProtocol::Sse,
            state: self.state(),
            connection_duration: *self.connected_for.lock(),
            messages_sent: 0,
            messages_received: self.traffic.load(Ordering::SeqCst),
            errors: 0,
            reconnect_attempts: 0,
            buffer_size: 0,
            average_latency_ms: None,
            last_error: None,
        }
    }

    fn pause(&self) {}

    fn resume(&self) {}

    fn is_paused(&self) -> bool {
        false
    }

    fn on(&self, kind: EventKind, listener: EventListener<TransportEvent>) -> ListenerId {
        self.listeners.on(kind, listener)
    }

    fn on_any(&self, listener: EventListener<TransportEvent>) -> ListenerId {
        self.listeners.on_any(listener)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.listeners.subscribe()
    }
}
