//! Incremental event-stream decoder.

use std::mem;
use std::time::Duration;

/// One dispatched event-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Last seen `id:` at dispatch time.
    pub id: Option<String>,
}

/// Output of [`SseDecoder::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    /// A complete event.
    Event(SseEvent),
    /// A `retry:` directive.
    Retry(Duration),
    /// A line or the event being assembled grew past `limit` bytes and was
    /// discarded along with the rest of that event.
    Overflow {
        /// The configured cap.
        limit: usize,
    },
}

/// Default cap on one line and on the data of one event.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Decodes `text/event-stream` bytes as they arrive.
///
/// Lines may end in `\r\n`, `\r` or `\n`, and a chunk boundary may fall
/// anywhere, including inside a multi-byte character or between `\r` and `\n`.
/// Bytes of an unterminated event are kept until the next chunk; an event that
/// is still open when the stream ends is discarded.
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    after_cr: bool,
    discarding: bool,
    skip_event: bool,
    max_line: usize,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            line: Vec::new(),
            after_cr: false,
            discarding: false,
            skip_event: false,
            max_line: MAX_LINE_BYTES,
            event: None,
            data: String::new(),
            has_data: false,
            last_event_id: None,
        }
    }
}

impl SseDecoder {
    /// Creates a decoder with no resumption id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder that starts from a known resumption id.
    pub fn with_last_event_id(last_event_id: Option<String>) -> Self {
        Self {
            last_event_id,
            ..Self::default()
        }
    }

    /// Caps a single line, and the data of one event, at `max_line` bytes.
    #[must_use]
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// The most recent `id:` value.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Consumes a chunk and returns every item it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        let mut items = Vec::new();
        for &byte in chunk {
            if mem::take(&mut self.after_cr) && byte == b'\n' {
                continue;
            }
            match byte {
                b'\n' => self.end_line(&mut items),
                b'\r' => {
                    self.after_cr = true;
                    self.end_line(&mut items);
                }
                _ if self.discarding => {}
                _ if self.line.len() >= self.max_line => {
                    self.discarding = true;
                    self.overflow(&mut items);
                }
                _ => self.line.push(byte),
            }
        }
        items
    }

    /// Drops the event being assembled; its remaining fields are skipped up to
    /// the blank line that would have dispatched it.
    fn overflow(&mut self, items: &mut Vec<SseItem>) {
        self.line.clear();
        self.skip_event = true;
        self.event = None;
        self.data.clear();
        self.has_data = false;
        items.push(SseItem::Overflow {
            limit: self.max_line,
        });
    }

    fn end_line(&mut self, items: &mut Vec<SseItem>) {
        if mem::take(&mut self.discarding) {
            return;
        }
        let raw = mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&raw);
        if line.is_empty() {
            if !mem::take(&mut self.skip_event) {
                self.dispatch(items);
            }
            return;
        }
        if self.skip_event || line.starts_with(':') {
            return;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (&line[..], ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.data.len() + value.len() + 1 > self.max_line {
                    self.overflow(items);
                    return;
                }
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
                    && let Ok(millis) = value.parse::<u64>()
                {
                    items.push(SseItem::Retry(Duration::from_millis(millis)));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, items: &mut Vec<SseItem>) {
        let event = self.event.take();
        let data = mem::take(&mut self.data);
        if !mem::take(&mut self.has_data) || data.is_empty() {
            return;
        }
        items.push(SseItem::Event(SseEvent {
            event,
            data,
            id: self.last_event_id.clone(),
        }));
    }
}
