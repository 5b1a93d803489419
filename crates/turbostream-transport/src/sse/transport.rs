//! Event-stream protocol driver.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use turbostream_transport_traits::{
    StreamEvent, TransportConfig, TransportError, TransportProtocol, TransportResult,
    TransportState,
};

use super::decoder::{SseDecoder, SseEvent, SseItem};
use crate::base::{BaseTransport, ConnectionContext, ProtocolDriver, SendOutcome};
use crate::network::http::post_payload;
use crate::network::{HttpClient, HttpRequest, ReqwestHttpClient};

/// Data value that ends the stream instead of being delivered.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Server-Sent Events transport.
pub type SseTransport = BaseTransport<SseDriver>;

type Body = BoxStream<'static, TransportResult<Bytes>>;

/// Reads a `text/event-stream` response; sends go out as one-shot `POST`s.
pub struct SseDriver {
    client: Arc<dyn HttpClient>,
    last_event_id: Arc<Mutex<Option<String>>>,
    pending: Mutex<Option<Body>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SseDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseDriver")
            .field("client", &self.client)
            .field("last_event_id", &*self.last_event_id.lock())
            .field("reading", &self.reader.lock().is_some())
            .finish()
    }
}

impl SseDriver {
    /// Creates a driver resuming from `last_event_id` on its first connect.
    pub fn new(client: Arc<dyn HttpClient>, last_event_id: Option<String>) -> Self {
        Self {
            client,
            last_event_id: Arc::new(Mutex::new(last_event_id)),
            pending: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// The resumption id sent on the next connect.
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().clone()
    }
}

impl BaseTransport<SseDriver> {
    /// Creates an event-stream transport using `reqwest`.
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let client = ReqwestHttpClient::new(&config)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Creates an event-stream transport on a caller-supplied HTTP client.
    pub fn with_client(
        config: TransportConfig,
        client: Arc<dyn HttpClient>,
    ) -> TransportResult<Self> {
        let driver = SseDriver::new(client, config.sse.last_event_id.clone());
        Self::with_driver(TransportProtocol::Sse, config, driver)
    }
}

/// Structured payload of an event; plain text is carried as a JSON string.
fn to_stream_event(event: SseEvent) -> StreamEvent {
    let data = serde_json::from_str(&event.data)
        .unwrap_or_else(|_| serde_json::Value::String(event.data));
    StreamEvent {
        data,
        event_type: event.event,
        id: event.id,
    }
}

async fn read_events(
    mut body: Body,
    ctx: ConnectionContext,
    last_event_id: Arc<Mutex<Option<String>>>,
) {
    let mut decoder = SseDecoder::with_last_event_id(last_event_id.lock().clone());
    loop {
        let chunk = tokio::select! {
            () = ctx.cancelled() => return,
            chunk = body.next() => chunk,
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(error)) => {
                ctx.connection_lost(error);
                return;
            }
            None => {
                ctx.connection_lost(TransportError::ConnectionLost(
                    "event stream ended without completion".to_string(),
                ));
                return;
            }
        };
        trace!("{} received {} bytes", ctx.transport_id(), bytes.len());

        for item in decoder.feed(&bytes) {
            match item {
                SseItem::Retry(delay) => ctx.set_reconnect_delay(delay),
                SseItem::Overflow { limit } => ctx.report_error(TransportError::Protocol(
                    format!("Event-stream event exceeds {limit} bytes"),
                )),
                SseItem::Event(event) => {
                    if let Some(id) = &event.id {
                        *last_event_id.lock() = Some(id.clone());
                    }
                    if event.data == DONE_SENTINEL {
                        ctx.complete();
                        return;
                    }
                    ctx.deliver(to_stream_event(event)).await;
                }
            }
        }
    }
}

#[async_trait]
impl ProtocolDriver for SseDriver {
    async fn open(&self, ctx: &ConnectionContext) -> TransportResult<()> {
        let config = ctx.config();
        let mut request = HttpRequest::get(&config.endpoint)
            .with_headers(&config.headers)
            .with_header("Accept", "text/event-stream")
            .with_header("Cache-Control", "no-cache");
        if let Some(id) = self.last_event_id() {
            request = request.with_header("Last-Event-ID", id);
        }

        let response = self.client.open_stream(request).await?;
        if !response.is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "event stream request returned HTTP {}",
                response.status
            )));
        }
        if let Some(content_type) = response.headers.get("content-type")
            && !content_type.starts_with("text/event-stream")
        {
            warn!(
                "{} expected text/event-stream, got {}",
                ctx.transport_id(),
                content_type
            );
        }

        *self.pending.lock() = Some(response.body);
        Ok(())
    }

    async fn on_connected(&self, ctx: &ConnectionContext) {
        let Some(body) = self.pending.lock().take() else {
            return;
        };
        let handle = tokio::spawn(read_events(
            body,
            ctx.clone(),
            Arc::clone(&self.last_event_id),
        ));
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
        debug!("{} reading event stream", ctx.transport_id());
    }

    async fn send(
        &self,
        config: &TransportConfig,
        _state: TransportState,
        payload: serde_json::Value,
    ) -> TransportResult<SendOutcome> {
        // The event-stream protocol has no upstream channel; use a separate request.
        post_payload(self.client.as_ref(), config, payload).await?;
        Ok(SendOutcome::Sent)
    }

    fn release(&self) {
        self.pending.lock().take();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
