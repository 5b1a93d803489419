//! Newline-delimited JSON framing.

use std::mem;

use serde_json::Value;

use turbostream_transport_traits::{TransportError, TransportResult};

/// Incremental decoder for `\n`-separated JSON records.
///
/// Bytes are buffered until a full line is available, so records (and
/// multi-byte UTF-8 sequences) may be split across chunks. Blank lines and a
/// trailing `\r` are ignored. A line longer than the limit is reported once as
/// a protocol error and skipped up to the next newline.
#[derive(Debug)]
pub struct NdjsonDecoder {
    line: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

/// Default cap on a single record.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self {
            line: Vec::new(),
            max_line: MAX_LINE_BYTES,
            discarding: false,
        }
    }
}

impl NdjsonDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps a single record at `max_line` bytes.
    #[must_use]
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Bytes of an incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.line.len()
    }

    /// Feeds one chunk, returning every record it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<TransportResult<Value>> {
        let mut records = Vec::new();
        let mut rest = chunk;
        loop {
            let newline = rest.iter().position(|b| *b == b'\n');
            let segment = newline.map_or(rest, |pos| &rest[..pos]);
            if !self.discarding {
                if self.line.len() + segment.len() > self.max_line {
                    self.line.clear();
                    self.discarding = true;
                    records.push(Err(TransportError::Protocol(format!(
                        "Record exceeds {} bytes",
                        self.max_line
                    ))));
                } else {
                    self.line.extend_from_slice(segment);
                }
            }

            let Some(pos) = newline else {
                return records;
            };
            rest = &rest[pos + 1..];
            if mem::take(&mut self.discarding) {
                continue;
            }
            let line = mem::take(&mut self.line);
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }
    }

    /// Parses an unterminated final line, if any.
    pub fn finish(&mut self) -> Option<TransportResult<Value>> {
        if mem::take(&mut self.discarding) {
            return None;
        }
        let line = mem::take(&mut self.line);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<TransportResult<Value>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(serde_json::from_slice(line).map_err(|e| {
        TransportError::Protocol(format!(
            "Malformed record '{}': {e}",
            String::from_utf8_lossy(line)
        ))
    }))
}

/// How a chunked-HTTP record is handled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
    Done,
    Error(String),
    Data(Value),
}

/// `{"done": true}` and `{"type": "done"}` end the stream;
/// `{"type": "error"}` carries a remote error.
pub(crate) fn classify(value: Value) -> Record {
    if value.get("done").and_then(Value::as_bool) == Some(true) {
        return Record::Done;
    }
    match value.get("type").and_then(Value::as_str) {
        Some("done") => Record::Done,
        Some("error") => {
            let message = value
                .get("message")
                .or_else(|| value.get("error"))
                .map_or_else(
                    || value.to_string(),
                    |m| m.as_str().map_or_else(|| m.to_string(), str::to_owned),
                );
            Record::Error(message)
        }
        _ => Record::Data(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_records_split_across_chunks() {
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.feed(br#"{"a":"#).is_empty());
        assert_eq!(decoder.pending(), 5);

        let records: Vec<_> = decoder
            .feed(b"1}\r\n\n{\"a\":2}\n{\"a\"")
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records, vec![json!({"a": 1}), json!({"a": 2})]);

        assert!(decoder.feed(b":3}").is_empty());
        assert_eq!(decoder.finish().unwrap().unwrap(), json!({"a": 3}));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_malformed_line_does_not_poison_decoder() {
        let mut decoder = NdjsonDecoder::new();
        let records = decoder.feed(b"{oops\n{\"ok\":true}\n");
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], Err(TransportError::Protocol(_))));
        assert_eq!(records[1].as_ref().unwrap(), &json!({"ok": true}));
    }

    #[test]
    fn test_oversized_record_is_skipped() {
        let mut decoder = NdjsonDecoder::new().with_max_line(16);
        let records = decoder.feed(br#"{"text":"a very long"#);
        assert!(matches!(records[..], [Err(TransportError::Protocol(_))]));
        assert_eq!(decoder.pending(), 0);

        assert!(decoder.feed(b" record that keeps going").is_empty());
        let records = decoder.feed(b"\"}\n{\"ok\":1}\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].as_ref().unwrap(), &json!({"ok": 1}));

        assert_eq!(decoder.feed(b"{\"tail\":\"also too long\"").len(), 1);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_split() {
        let text = "{\"t\":\"héllo\"}\n".as_bytes();
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.feed(&text[..8]).is_empty());
        let records = decoder.feed(&text[8..]);
        assert_eq!(records[0].as_ref().unwrap()["t"], "héllo");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(json!({"done": true})), Record::Done);
        assert_eq!(classify(json!({"type": "done"})), Record::Done);
        assert_eq!(
            classify(json!({"type": "error", "message": "quota"})),
            Record::Error("quota".into())
        );
        assert_eq!(
            classify(json!({"done": false, "n": 1})),
            Record::Data(json!({"done": false, "n": 1}))
        );
    }
}
