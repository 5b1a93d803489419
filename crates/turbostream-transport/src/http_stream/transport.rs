//! Chunked-HTTP protocol driver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use turbostream_transport_traits::{
    StreamEvent, TransportConfig, TransportError, TransportProtocol, TransportResult,
    TransportState,
};

use super::ndjson::{NdjsonDecoder, Record, classify};
use crate::base::{BaseTransport, ConnectionContext, ProtocolDriver, SendOutcome};
use crate::network::http::post_payload;
use crate::network::{HttpClient, HttpRequest, ReqwestHttpClient};

/// How long a reader yields when the buffer is at its high-water mark.
pub const THROTTLE_PAUSE: Duration = Duration::from_millis(10);

/// Chunked-HTTP transport.
pub type HttpStreamTransport = BaseTransport<HttpStreamDriver>;

type Body = BoxStream<'static, TransportResult<Bytes>>;

/// What `open()` produced for `on_connected()` to consume.
enum Pending {
    Stream(Body),
    Poll(Option<Value>),
}

/// Reads newline-delimited JSON from a streamed body, or polls when
/// `long_polling` is set. Sends go out as one-shot `POST`s.
pub struct HttpStreamDriver {
    client: Arc<dyn HttpClient>,
    pending: Mutex<Option<Pending>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for HttpStreamDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamDriver")
            .field("client", &self.client)
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}

impl HttpStreamDriver {
    /// Creates a driver on `client`.
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            pending: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

impl BaseTransport<HttpStreamDriver> {
    /// Creates a chunked-HTTP transport using `reqwest`.
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        let client = ReqwestHttpClient::new(&config)?;
        Self::with_client(config, Arc::new(client))
    }

    /// Creates a chunked-HTTP transport on a caller-supplied HTTP client.
    pub fn with_client(
        config: TransportConfig,
        client: Arc<dyn HttpClient>,
    ) -> TransportResult<Self> {
        Self::with_driver(
            TransportProtocol::HttpStream,
            config,
            HttpStreamDriver::new(client),
        )
    }
}

fn build_request(config: &TransportConfig, accept: &str) -> HttpRequest {
    let request = match &config.http_stream.request_body {
        Some(body) => HttpRequest::post(&config.endpoint, body.clone()),
        None => HttpRequest::get(&config.endpoint),
    };
    request
        .with_headers(&config.headers)
        .with_header("Accept", accept)
}

/// One long-poll round trip. `None` means the server had nothing to say.
async fn poll_once(client: &dyn HttpClient, config: &TransportConfig) -> TransportResult<Option<Value>> {
    let request = build_request(config, "application/json").with_timeout(config.timeout);
    let response = client.request(request).await?;
    if response.status == 204 {
        return Ok(None);
    }
    if !response.is_success() {
        return Err(TransportError::ConnectionFailed(format!(
            "poll of {} returned HTTP {}",
            config.endpoint, response.status
        )));
    }
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&response.body)
        .map(Some)
        .map_err(|e| TransportError::Protocol(format!("Malformed poll response: {e}")))
}

fn to_stream_event(value: Value) -> StreamEvent {
    let event_type = value.get("type").and_then(Value::as_str).map(str::to_owned);
    let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
    StreamEvent {
        data: value,
        event_type,
        id,
    }
}

/// Handles one decoded record. Returns `false` once the stream is done.
async fn handle_record(ctx: &ConnectionContext, record: TransportResult<Value>) -> bool {
    match record.map(classify) {
        Ok(Record::Done) => {
            ctx.complete();
            false
        }
        Ok(Record::Error(message)) => {
            ctx.report_error(TransportError::Remote { message });
            true
        }
        Ok(Record::Data(value)) => {
            ctx.deliver(to_stream_event(value)).await;
            true
        }
        Err(error) => {
            ctx.report_error(error);
            true
        }
    }
}

/// Gives the drain a chance to catch up while the buffer is above its mark.
async fn throttle(ctx: &ConnectionContext) {
    if ctx.is_high_water() && !ctx.is_paused() {
        trace!("{} throttling read at high-water mark", ctx.transport_id());
        tokio::time::sleep(THROTTLE_PAUSE).await;
    }
}

async fn read_stream(mut body: Body, ctx: ConnectionContext) {
    let chunk_size = ctx.config().http_stream.chunk_size.max(1);
    let mut decoder = NdjsonDecoder::new();
    loop {
        throttle(&ctx).await;
        let chunk = tokio::select! {
            () = ctx.cancelled() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for (index, slice) in bytes.chunks(chunk_size).enumerate() {
                    if index > 0 {
                        throttle(&ctx).await;
                    }
                    for record in decoder.feed(slice) {
                        if !handle_record(&ctx, record).await {
                            return;
                        }
                    }
                }
            }
            Some(Err(error)) => {
                ctx.connection_lost(error);
                return;
            }
            None => {
                if let Some(record) = decoder.finish()
                    && !handle_record(&ctx, record).await
                {
                    return;
                }
                debug!("{} response body ended", ctx.transport_id());
                ctx.complete();
                return;
            }
        }
    }
}

async fn poll_loop(client: Arc<dyn HttpClient>, ctx: ConnectionContext, first: Option<Value>) {
    if let Some(value) = first
        && !handle_record(&ctx, Ok(value)).await
    {
        return;
    }
    let interval = ctx.config().http_stream.long_polling_interval;
    loop {
        tokio::select! {
            () = ctx.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        let result = tokio::select! {
            () = ctx.cancelled() => return,
            result = poll_once(client.as_ref(), ctx.config()) => result,
        };
        match result {
            Ok(Some(value)) => {
                if !handle_record(&ctx, Ok(value)).await {
                    return;
                }
            }
            Ok(None) => trace!("{} poll returned nothing", ctx.transport_id()),
            Err(error) => {
                // The reconnect backoff decides when the next poll happens.
                ctx.connection_lost(error);
                return;
            }
        }
    }
}

#[async_trait]
impl ProtocolDriver for HttpStreamDriver {
    async fn open(&self, ctx: &ConnectionContext) -> TransportResult<()> {
        let config = ctx.config();
        let pending = if config.http_stream.long_polling {
            Pending::Poll(poll_once(self.client.as_ref(), config).await?)
        } else {
            let response = self
                .client
                .open_stream(build_request(config, "application/x-ndjson"))
                .await?;
            if !response.is_success() {
                return Err(TransportError::ConnectionFailed(format!(
                    "stream request returned HTTP {}",
                    response.status
                )));
            }
            Pending::Stream(response.body)
        };
        *self.pending.lock() = Some(pending);
        Ok(())
    }

    async fn on_connected(&self, ctx: &ConnectionContext) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        let handle = match pending {
            Pending::Stream(body) => {
                debug!("{} reading chunked body", ctx.transport_id());
                tokio::spawn(read_stream(body, ctx.clone()))
            }
            Pending::Poll(first) => {
                debug!(
                    "{} long polling every {:?}",
                    ctx.transport_id(),
                    ctx.config().http_stream.long_polling_interval
                );
                tokio::spawn(poll_loop(Arc::clone(&self.client), ctx.clone(), first))
            }
        };
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn send(
        &self,
        config: &TransportConfig,
        _state: TransportState,
        payload: Value,
    ) -> TransportResult<SendOutcome> {
        post_payload(self.client.as_ref(), config, payload).await?;
        Ok(SendOutcome::Sent)
    }

    fn release(&self) {
        self.pending.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}
