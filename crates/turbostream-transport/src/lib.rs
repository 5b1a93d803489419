//! # TurboStream Transport
//!
//! Streaming transports with automatic reconnection, bounded buffering and
//! backpressure, plus a pool manager.
//!
//! ## Transports
//!
//! - [`SseTransport`]: Server-Sent Events with `Last-Event-ID` resumption
//! - [`WebSocketTransport`]: full-duplex socket with send queue and heartbeat
//! - [`HttpStreamTransport`]: newline-delimited JSON over a chunked body, or long polling
//!
//! All three are [`BaseTransport`]s: one shared state machine driven by a
//! protocol-specific [`ProtocolDriver`]. Network access goes through the
//! injected [`network::HttpClient`] and [`network::SocketConnector`]
//! capabilities.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turbostream_transport::{EventKind, Transport, TransportConfig, TransportEvent, TransportProtocol};
//!
//! # async fn run() -> turbostream_transport::TransportResult<()> {
//! let config = TransportConfig::new("https://api.example.com/events")
//!     .with_header("Authorization", "Bearer token");
//! let transport = turbostream_transport::create_transport(TransportProtocol::Sse, config)?;
//!
//! transport.on(
//!     EventKind::Message,
//!     Arc::new(|event: &TransportEvent| {
//!         if let TransportEvent::Message(message) = event {
//!             println!("{}", message.data);
//!         }
//!     }),
//! );
//! transport.connect().await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

use std::sync::Arc;

pub mod base;
pub mod http_stream;
pub mod manager;
pub mod network;
pub mod sse;
pub mod websocket;

pub use base::{BaseTransport, ConnectionContext, ProtocolDriver, SendOutcome};
pub use http_stream::HttpStreamTransport;
pub use manager::{
    ManagerConfig, PoolEvent, PoolEventKind, RemovalReason, TransportManager, TransportRegistry,
};
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

// Re-export the contract layer so most users need only this crate.
pub use turbostream_transport_traits::*;

/// Builds a transport for `protocol` with the built-in constructors.
///
/// The transport starts `idle`; call [`Transport::connect`] to open it.
pub fn create_transport(
    protocol: TransportProtocol,
    config: TransportConfig,
) -> TransportResult<Arc<dyn Transport>> {
    TransportRegistry::with_defaults().create(protocol, config)
}
