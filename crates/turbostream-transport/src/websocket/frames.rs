//! Socket frame interpretation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use url::Url;

use turbostream_transport_traits::{BinaryType, StreamEvent, TransportError, TransportResult};

use crate::network::SocketFrame;

/// Meaning of one inbound application frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    /// `{"type": "done"}`
    Done,
    /// `{"type": "error", ...}` with the extracted message.
    Error(String),
    /// `{"type": "ping", ...}` from the server.
    Ping(Value),
    /// `{"type": "pong", ...}` answering our ping.
    Pong(Value),
    /// Anything else.
    Event(StreamEvent),
}

/// Rewrites `http(s)` endpoints to `ws(s)`; socket schemes pass through.
pub(crate) fn normalize_endpoint(endpoint: &str) -> TransportResult<String> {
    let mut url = Url::parse(endpoint).map_err(|e| {
        TransportError::Configuration(format!("Invalid socket endpoint '{endpoint}': {e}"))
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Configuration(format!(
                "Unsupported socket scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme).map_err(|()| {
        TransportError::Configuration(format!("Cannot use scheme '{scheme}' for {endpoint}"))
    })?;
    Ok(url.into())
}

/// Decodes one data frame. `Close` frames are handled by the reader.
pub(crate) fn decode_frame(frame: SocketFrame, binary_type: BinaryType) -> TransportResult<Inbound> {
    match frame {
        SocketFrame::Text(text) => Ok(classify(parse_text(text))),
        SocketFrame::Binary(data) => match binary_type {
            BinaryType::Json => {
                let text = String::from_utf8(data.to_vec()).map_err(|e| {
                    TransportError::Protocol(format!("Binary frame is not UTF-8: {e}"))
                })?;
                Ok(classify(parse_text(text)))
            }
            BinaryType::Base64 => Ok(Inbound::Event(
                StreamEvent::new(json!({
                    "type": "binary",
                    "data": STANDARD.encode(&data),
                }))
                .with_event_type("binary"),
            )),
        },
        SocketFrame::Close(_) => Err(TransportError::Protocol(
            "Close frame is not a data frame".to_string(),
        )),
    }
}

fn parse_text(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn error_message(value: &Value) -> String {
    match (value.get("message"), value.get("error")) {
        (Some(Value::String(message)), _) => message.clone(),
        (_, Some(Value::String(message))) => message.clone(),
        (_, Some(Value::Object(error))) => error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| Value::Object(error.clone()).to_string(), str::to_owned),
        _ => value.to_string(),
    }
}

fn classify(value: Value) -> Inbound {
    let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match kind.as_deref() {
        Some("done") => Inbound::Done,
        Some("error") => Inbound::Error(error_message(&value)),
        Some("ping") => Inbound::Ping(value),
        Some("pong") => Inbound::Pong(value),
        _ => {
            let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
            Inbound::Event(StreamEvent {
                data: value,
                event_type: kind,
                id,
            })
        }
    }
}
