//! Socket protocol driver.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use turbostream_transport_traits::{
    BinaryType, StreamEvent, TransportConfig, TransportError, TransportProtocol, TransportResult,
    TransportState,
};

use super::frames::{Inbound, decode_frame, normalize_endpoint};
use super::heartbeat::{Liveness, run_heartbeat};
use crate::base::{BaseTransport, ConnectionContext, ProtocolDriver, SendOutcome};
use crate::network::{
    SocketConnector, SocketFrame, SocketRequest, SocketSink, SocketStream, TungsteniteConnector,
};

/// WebSocket transport.
pub type WebSocketTransport = BaseTransport<WebSocketDriver>;

/// Write half of one connection, shared by `send()`, the heartbeat and ping replies.
pub(crate) type Writer = Arc<tokio::sync::Mutex<Option<SocketSink>>>;

/// The connection direct sends go to.
struct Link {
    writer: Writer,
    ctx: ConnectionContext,
}

/// Payloads waiting for a connection, and the connection once it is live.
///
/// Both sit behind one lock: a payload is either queued before the flush on
/// connect or sees the link and writes after it.
#[derive(Default)]
struct Outbound {
    queue: VecDeque<Value>,
    link: Option<Link>,
}

/// Full-duplex socket driver with an outbound queue for disconnected periods.
pub struct WebSocketDriver {
    connector: Arc<dyn SocketConnector>,
    url: String,
    pending: Mutex<Option<(SocketStream, Writer)>>,
    outbound: Mutex<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    liveness: Arc<Mutex<Liveness>>,
}

impl fmt::Debug for WebSocketDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outbound = self.outbound.lock();
        f.debug_struct("WebSocketDriver")
            .field("connector", &self.connector)
            .field("url", &self.url)
            .field("queued", &outbound.queue.len())
            .field("linked", &outbound.link.is_some())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

impl WebSocketDriver {
    /// Creates a driver for `endpoint`, rewriting `http(s)` to `ws(s)`.
    pub fn new(connector: Arc<dyn SocketConnector>, endpoint: &str) -> TransportResult<Self> {
        Ok(Self {
            connector,
            url: normalize_endpoint(endpoint)?,
            pending: Mutex::new(None),
            outbound: Mutex::new(Outbound::default()),
            tasks: Mutex::new(Vec::new()),
            liveness: Arc::new(Mutex::new(Liveness::default())),
        })
    }

    /// The normalized socket URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payloads waiting for the connection to return.
    pub fn queued_len(&self) -> usize {
        self.outbound.lock().queue.len()
    }

    /// When the last pong arrived on the current connection.
    pub fn last_pong(&self) -> Option<Instant> {
        self.liveness.lock().last_pong()
    }

    /// Writes queued payloads in submission order. Returns how many went out.
    ///
    /// A payload leaves the queue only once the sink accepted it.
    async fn flush_queue(&self, sink: &mut SocketSink) -> TransportResult<usize> {
        let mut flushed = 0;
        loop {
            let Some(payload) = self.outbound.lock().queue.front().cloned() else {
                return Ok(flushed);
            };
            sink.send(SocketFrame::Text(payload.to_string())).await?;
            self.outbound.lock().queue.pop_front();
            flushed += 1;
        }
    }

    /// Flushes the queue and writes `payload` behind it. `None` when the
    /// connection was released before the writer became available.
    async fn write(&self, writer: &Writer, payload: &Value) -> TransportResult<Option<usize>> {
        let mut guard = writer.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Ok(None);
        };
        let flushed = self.flush_queue(sink).await?;
        sink.send(SocketFrame::Text(payload.to_string())).await?;
        Ok(Some(flushed))
    }
}

fn record_flushed(ctx: &ConnectionContext, count: usize) {
    for _ in 0..count {
        ctx.record_sent();
    }
}

impl BaseTransport<WebSocketDriver> {
    /// Creates a socket transport using `tokio-tungstenite`.
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector::new()))
    }

    /// Creates a socket transport on a caller-supplied connector.
    pub fn with_connector(
        config: TransportConfig,
        connector: Arc<dyn SocketConnector>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let driver = WebSocketDriver::new(connector, &config.endpoint)?;
        Self::with_driver(TransportProtocol::WebSocket, config, driver)
    }
}

async fn reply_pong(writer: &Writer, ping: &Value) -> TransportResult<()> {
    let pong = json!({
        "type": "pong",
        "timestamp": ping.get("timestamp").cloned().unwrap_or(Value::Null),
    });
    let mut guard = writer.lock().await;
    match guard.as_mut() {
        Some(sink) => sink.send(SocketFrame::Text(pong.to_string())).await,
        None => Ok(()),
    }
}

async fn read_frames(
    mut stream: SocketStream,
    ctx: ConnectionContext,
    writer: Writer,
    liveness: Arc<Mutex<Liveness>>,
    binary_type: BinaryType,
) {
    let mut completed = false;
    loop {
        let frame = tokio::select! {
            () = ctx.cancelled() => return,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(SocketFrame::Close(reason))) => {
                if completed {
                    debug!("{} closed by peer after completion", ctx.transport_id());
                    return;
                }
                ctx.connection_lost(TransportError::ConnectionLost(format!(
                    "closed by peer ({})",
                    reason.as_deref().unwrap_or("no reason")
                )));
                return;
            }
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                ctx.connection_lost(error);
                return;
            }
            None => {
                if !completed {
                    ctx.connection_lost(TransportError::ConnectionLost(
                        "socket stream ended".to_string(),
                    ));
                }
                return;
            }
        };

        match decode_frame(frame, binary_type) {
            Ok(Inbound::Done) => {
                completed = true;
                ctx.complete();
            }
            Ok(Inbound::Error(message)) => ctx.report_error(TransportError::Remote { message }),
            Ok(Inbound::Ping(ping)) => {
                if let Err(error) = reply_pong(&writer, &ping).await {
                    warn!("{} failed to answer ping: {}", ctx.transport_id(), error);
                }
                ctx.deliver(StreamEvent::new(ping).with_event_type("ping"))
                    .await;
            }
            Ok(Inbound::Pong(pong)) => {
                let rtt = liveness.lock().pong_received(Instant::now());
                if let Some(rtt) = rtt {
                    ctx.record_latency(rtt);
                }
                ctx.deliver(StreamEvent::new(pong).with_event_type("pong"))
                    .await;
            }
            Ok(Inbound::Event(event)) => ctx.deliver(event).await,
            Err(error) => ctx.report_error(error),
        }
    }
}

#[async_trait]
impl ProtocolDriver for WebSocketDriver {
    async fn open(&self, ctx: &ConnectionContext) -> TransportResult<()> {
        let config = ctx.config();
        let request = SocketRequest {
            url: self.url.clone(),
            headers: config.headers.clone(),
            protocols: config.websocket.protocols.clone(),
        };
        let connection = self.connector.connect(request).await?;
        if let Some(protocol) = &connection.protocol {
            info!("{} negotiated sub-protocol {}", ctx.transport_id(), protocol);
        }

        self.liveness.lock().reset();
        let writer = Arc::new(tokio::sync::Mutex::new(Some(connection.sink)));
        *self.pending.lock() = Some((connection.stream, writer));
        Ok(())
    }

    async fn on_connected(&self, ctx: &ConnectionContext) {
        let Some((stream, writer)) = self.pending.lock().take() else {
            return;
        };
        // Direct sends wait on this guard, so they land after the flush.
        let mut guard = writer.lock().await;
        self.outbound.lock().link = Some(Link {
            writer: Arc::clone(&writer),
            ctx: ctx.clone(),
        });

        let config = ctx.config();
        let mut handles = vec![tokio::spawn(read_frames(
            stream,
            ctx.clone(),
            Arc::clone(&writer),
            Arc::clone(&self.liveness),
            config.websocket.binary_type,
        ))];
        if let Some(interval) = config.websocket.heartbeat_interval {
            handles.push(tokio::spawn(run_heartbeat(
                interval,
                ctx.clone(),
                Arc::clone(&writer),
                Arc::clone(&self.liveness),
            )));
        }
        for previous in std::mem::replace(&mut *self.tasks.lock(), handles) {
            previous.abort();
        }

        let flushed = match guard.as_mut() {
            Some(sink) => tokio::select! {
                () = ctx.cancelled() => return,
                result = self.flush_queue(sink) => result,
            },
            None => Ok(0),
        };
        drop(guard);
        match flushed {
            Ok(0) => {}
            Ok(count) => {
                debug!("{} flushed {} queued payloads", ctx.transport_id(), count);
                record_flushed(ctx, count);
            }
            Err(error) => ctx.connection_lost(error),
        }
    }

    async fn send(
        &self,
        _config: &TransportConfig,
        state: TransportState,
        payload: Value,
    ) -> TransportResult<SendOutcome> {
        if !matches!(
            state,
            TransportState::Connecting | TransportState::Connected | TransportState::Reconnecting
        ) {
            return Err(TransportError::NotConnected(format!("socket is {state}")));
        }

        let (writer, ctx) = {
            let mut outbound = self.outbound.lock();
            let live = outbound
                .link
                .as_ref()
                .filter(|link| !link.ctx.token().is_cancelled())
                .map(|link| (Arc::clone(&link.writer), link.ctx.clone()));
            match live {
                Some(live) => live,
                None => {
                    outbound.queue.push_back(payload);
                    return Ok(SendOutcome::Queued);
                }
            }
        };

        let written = tokio::select! {
            () = ctx.cancelled() => {
                return Err(TransportError::ConnectionLost(
                    "socket released while writing".to_string(),
                ));
            }
            written = self.write(&writer, &payload) => written?,
        };
        match written {
            Some(flushed) => {
                record_flushed(&ctx, flushed);
                Ok(SendOutcome::Sent)
            }
            None => {
                // Released between the link lookup and the write; retry after reconnect.
                self.outbound.lock().queue.push_back(payload);
                Ok(SendOutcome::Queued)
            }
        }
    }

    fn release(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.pending.lock().take();
        let link = self.outbound.lock().link.take();
        self.liveness.lock().reset();

        // A write in progress keeps the lock until its connection token fires
        // and then drops the sink with the last writer handle.
        let taken = link.and_then(|link| {
            let mut guard = link.writer.try_lock().ok()?;
            guard.take()
        });
        if let Some(mut sink) = taken
            && let Ok(runtime) = Handle::try_current()
        {
            runtime.spawn(async move {
                let _ = sink.close().await;
            });
        }
    }

    fn close(&self) {
        self.outbound.lock().queue.clear();
        self.release();
    }
}
