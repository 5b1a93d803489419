//! Chunked-HTTP transport.
//!
//! The default mode reads one long response whose body is newline-delimited
//! JSON. With `http_stream.long_polling` set, the transport instead issues one
//! request per interval and treats each response body as a single event.
//!
//! In both modes `{"done": true}` or `{"type": "done"}` ends the stream and
//! `{"type": "error"}` is reported as a remote error.

mod ndjson;
mod transport;

pub use ndjson::{MAX_LINE_BYTES, NdjsonDecoder};
pub use transport::{HttpStreamDriver, HttpStreamTransport, THROTTLE_PAUSE};
