//! Socket capability and its tokio-tungstenite implementation.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tracing::{debug, trace};

use turbostream_transport_traits::{TransportError, TransportResult};

/// Application-level socket frame.
///
/// Control frames (ping/pong) are handled by the socket library and never surface here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Close frame, with the peer's reason when one was given.
    Close(Option<String>),
}

/// Write half of a socket.
pub type SocketSink = Pin<Box<dyn Sink<SocketFrame, Error = TransportError> + Send>>;

/// Read half of a socket.
pub type SocketStream = BoxStream<'static, TransportResult<SocketFrame>>;

/// Handshake parameters.
#[derive(Debug, Clone)]
pub struct SocketRequest {
    /// `ws://` or `wss://` URL.
    pub url: String,
    /// Extra handshake headers.
    pub headers: HashMap<String, String>,
    /// Offered sub-protocols.
    pub protocols: Vec<String>,
}

/// An established socket split into its halves.
pub struct SocketConnection {
    /// Write half.
    pub sink: SocketSink,
    /// Read half.
    pub stream: SocketStream,
    /// Sub-protocol selected by the server.
    pub protocol: Option<String>,
}

impl fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConnection")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// Network capability used by the socket driver.
#[async_trait]
pub trait SocketConnector: Send + Sync + fmt::Debug {
    /// Performs the opening handshake.
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketConnection>;
}

/// [`SocketConnector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Creates a connector.
    pub fn new() -> Self {
        Self
    }
}

fn to_message(frame: SocketFrame) -> Message {
    match frame {
        SocketFrame::Text(text) => Message::text(text),
        SocketFrame::Binary(data) => Message::binary(data),
        SocketFrame::Close(_) => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<SocketFrame> {
    match message {
        Message::Text(text) => Some(SocketFrame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(SocketFrame::Binary(data)),
        Message::Close(frame) => Some(SocketFrame::Close(
            frame.map(|f| f.reason.as_str().to_owned()),
        )),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
            trace!("Skipping control frame");
            None
        }
    }
}

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, request: SocketRequest) -> TransportResult<SocketConnection> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Configuration(format!("Invalid socket URL: {e}")))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Configuration(format!("Invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::Configuration(format!("Invalid header value for '{name}': {e}"))
            })?;
            handshake.headers_mut().insert(name, value);
        }

        if !request.protocols.is_empty() {
            let offered = HeaderValue::from_str(&request.protocols.join(", ")).map_err(|e| {
                TransportError::Configuration(format!("Invalid sub-protocol list: {e}"))
            })?;
            handshake.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let (socket, response) = tokio_tungstenite::connect_async(handshake)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!("Socket handshake with {} complete (protocol: {:?})", request.url, protocol);

        let (write, read) = socket.split();
        let sink = write
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(|frame: SocketFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));
        let stream = read
            .filter_map(|message| {
                future::ready(match message {
                    Ok(message) => from_message(message).map(Ok),
                    Err(e) => Some(Err(TransportError::ConnectionLost(e.to_string()))),
                })
            })
            .boxed();

        Ok(SocketConnection {
            sink: Box::pin(sink),
            stream,
            protocol,
        })
    }
}
