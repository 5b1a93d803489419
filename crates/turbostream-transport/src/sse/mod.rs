//! Server-Sent Events transport.
//!
//! Opens a long-lived `GET` with `Accept: text/event-stream`, decodes the
//! body incrementally and feeds each event into the backpressure pipeline.
//! A `data: [DONE]` event completes the stream.

mod decoder;
mod transport;

pub use decoder::{MAX_LINE_BYTES, SseDecoder, SseEvent, SseItem};
pub use transport::{DONE_SENTINEL, SseDriver, SseTransport};
