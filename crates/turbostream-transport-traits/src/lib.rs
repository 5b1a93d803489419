//! # TurboStream Transport Traits
//!
//! Core transport traits and types for the TurboStream streaming SDK.
//! This crate provides the foundational abstractions that every protocol
//! transport (event-stream, socket, chunked HTTP) and the pool manager depend on.
//!
//! ## Overview
//!
//! This crate defines:
//! - **Traits**: [`Transport`]
//! - **Types**: [`TransportProtocol`], [`TransportState`], [`StreamEvent`]
//! - **Errors**: [`TransportError`], [`TransportResult`], [`ErrorContext`]
//! - **Config**: [`TransportConfig`], [`ReconnectConfig`], [`BufferConfig`] and the
//!   per-protocol option structs
//! - **Buffering**: [`MessageBuffer`] with its [`BufferStrategy`] eviction policies
//! - **Events**: [`TransportEvent`], [`EventKind`], [`ListenerRegistry`]
//! - **Metrics**: [`TransportMetrics`], [`TransportHealth`], [`LatencyWindow`]
//!
//! ## Usage
//!
//! ```rust
//! use turbostream_transport_traits::{BufferStrategy, MessageBuffer};
//!
//! let mut buffer = MessageBuffer::new(3, BufferStrategy::DropOldest, 0.8);
//! for item in ["A", "B", "C", "D"] {
//!     assert!(buffer.push(item));
//! }
//! assert_eq!(buffer.get_all(), vec!["B", "C", "D"]);
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

mod buffer;
mod config;
mod error;
mod events;
mod metrics;
mod traits;
mod types;

// Re-export all public items
pub use buffer::MessageBuffer;
pub use config::{
    BinaryType, BufferConfig, BufferStrategy, HttpStreamOptions, ReconnectConfig,
    RetryPredicate, SseOptions, TransportConfig, WebSocketOptions, JITTER_RATIO,
};
pub use error::{ErrorContext, TransportError, TransportResult};
pub use events::{
    Categorized, EventKind, EventListener, ListenerId, ListenerRegistry, StreamEvent,
    TransportEvent,
};
pub use metrics::{LatencyWindow, TransportHealth, TransportMetrics, LATENCY_SAMPLE_LIMIT};
pub use traits::Transport;
pub use types::{TransportProtocol, TransportState};
