//! Injected network capabilities.
//!
//! Protocol drivers never talk to a socket library directly; they receive an
//! [`HttpClient`] or [`SocketConnector`] so tests and embedders can substitute
//! their own primitives.

pub mod http;
pub mod socket;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStream, ReqwestHttpClient};
pub use socket::{
    SocketConnection, SocketConnector, SocketFrame, SocketRequest, SocketSink, SocketStream,
    TungsteniteConnector,
};
