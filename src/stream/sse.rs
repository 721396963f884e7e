//! Incremental SSE decoding for upstream completion streams.
//!
//! [`FrameDecoder`] is fed raw body bytes as they arrive and hands back one
//! event payload per blank-line-terminated event. It never needs the whole
//! body: memory is bounded by the current unfinished line plus the lines of
//! the event being accumulated.
use bytes::BytesMut;
use memchr::memchr;

use crate::error::StreamError;
use crate::protocol::chat::CompletionChunk;

/// Sentinel payload that ends a stream in lieu of a finished chunk.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest line accepted before the frame is declared malformed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Largest event payload accepted before the frame is declared malformed.
pub const MAX_EVENT_BYTES: usize = MAX_LINE_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Between events; blank lines here are ignored.
    Idle,
    /// At least one non-blank line of the current event has been seen.
    Accumulating,
}

/// Line-accumulating SSE state machine.
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecoderState,
    data_lines: Vec<String>,
    event_bytes: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: DecoderState::Idle,
            data_lines: Vec::new(),
            event_bytes: 0,
        }
    }

    /// Append raw body bytes. Nothing is parsed until [`Self::next_payload`].
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Return the payload of the next complete event buffered so far.
    ///
    /// Yields `Ok(None)` once the buffered bytes hold no further complete
    /// event. The payload of an event without `data:` lines is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Decode`] for a line that is not valid UTF-8 and
    /// [`StreamError::MalformedFrame`] for a line longer than
    /// [`MAX_LINE_BYTES`] or an event whose data outgrows [`MAX_EVENT_BYTES`].
    pub fn next_payload(&mut self) -> Result<Option<String>, StreamError> {
        loop {
            let newline = memchr(b'\n', &self.buffer);
            if newline.unwrap_or(self.buffer.len()) > MAX_LINE_BYTES {
                return Err(StreamError::MalformedFrame(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes"
                )));
            }
            let Some(newline) = newline else {
                return Ok(None);
            };

            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                match self.state {
                    DecoderState::Idle => continue,
                    DecoderState::Accumulating => {
                        self.state = DecoderState::Idle;
                        let payload = self.data_lines.join("\n");
                        self.data_lines.clear();
                        self.event_bytes = 0;
                        return Ok(Some(payload.trim().to_owned()));
                    }
                }
            }

            self.state = DecoderState::Accumulating;
            let line = std::str::from_utf8(&line)
                .map_err(|e| StreamError::Decode(format!("event line is not UTF-8: {e}")))?;
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim();
                self.event_bytes += value.len() + 1;
                if self.event_bytes > MAX_EVENT_BYTES {
                    return Err(StreamError::MalformedFrame(format!(
                        "event exceeds {MAX_EVENT_BYTES} bytes"
                    )));
                }
                self.data_lines.push(value.to_owned());
            }
            // Other field names (event:, id:, retry:) carry nothing we relay.
        }
    }

    /// True while an event has started but its terminating blank line has
    /// not arrived yet.
    #[must_use]
    pub fn has_partial_event(&self) -> bool {
        self.state == DecoderState::Accumulating || !self.buffer.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A chunk decoded from one event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub chunk: CompletionChunk,
    /// No further event should be read after this one.
    pub terminal: bool,
}

/// Interpret one event payload.
///
/// `[DONE]` becomes a finished chunk, a payload starting with `{` is decoded
/// as a [`CompletionChunk`], anything else non-empty is plain delta text.
///
/// # Errors
///
/// Returns [`StreamError::MalformedFrame`] when a `{`-prefixed payload is not
/// a valid chunk object.
pub fn parse_payload(payload: &str) -> Result<Option<ParsedEvent>, StreamError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    if payload == DONE_SENTINEL {
        return Ok(Some(ParsedEvent {
            chunk: CompletionChunk::finished(),
            terminal: true,
        }));
    }
    if payload.starts_with('{') {
        let chunk: CompletionChunk = serde_json::from_str(payload)
            .map_err(|e| StreamError::MalformedFrame(e.to_string()))?;
        let terminal = chunk.is_finished;
        return Ok(Some(ParsedEvent { chunk, terminal }));
    }
    Ok(Some(ParsedEvent {
        chunk: CompletionChunk::delta(payload),
        terminal: false,
    }))
}

/// Format a data-only SSE frame.
#[must_use]
pub fn encode_data_frame(json: &[u8]) -> bytes::Bytes {
    let mut out = BytesMut::with_capacity(8 + json.len());
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(json);
    out.extend_from_slice(b"\n\n");
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(payload) = decoder.next_payload().unwrap() {
            out.push(payload);
        }
        out
    }

    #[test]
    fn test_decode_simple_event() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: hello world\n\n");
        assert_eq!(drain(&mut decoder), vec!["hello world"]);
        assert!(!decoder.has_partial_event());
    }

    #[test]
    fn test_decode_multiline_data_joined() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: line1\ndata:line2\n\n");
        assert_eq!(drain(&mut decoder), vec!["line1\nline2"]);
    }

    #[test]
    fn test_decode_ignores_comments_and_other_fields() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b": keep-alive\nevent: delta\nid: 7\ndata: x\n\n");
        assert_eq!(drain(&mut decoder), vec!["x"]);
    }

    #[test]
    fn test_decode_comment_only_event_is_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b": ping\n\n");
        assert_eq!(drain(&mut decoder), vec![""]);
    }

    #[test]
    fn test_decode_incremental_bytes() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: hel");
        assert_eq!(decoder.next_payload().unwrap(), None);
        decoder.feed(b"lo\n");
        assert_eq!(decoder.next_payload().unwrap(), None);
        assert!(decoder.has_partial_event());
        decoder.feed(b"\n");
        assert_eq!(decoder.next_payload().unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_decode_crlf_and_leading_blank_lines() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"\r\n\r\ndata: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(drain(&mut decoder), vec!["a", "b"]);
    }

    #[test]
    fn test_decode_utf8_split_across_feeds() {
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|b| *b >= 0x80).unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        decoder.feed(&text[..split]);
        assert_eq!(decoder.next_payload().unwrap(), None);
        decoder.feed(&text[split..]);
        assert_eq!(drain(&mut decoder), vec!["héllo"]);
    }

    #[test]
    fn test_decode_invalid_utf8_is_decode_error() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: \xff\xfe\n\n");
        assert!(matches!(
            decoder.next_payload(),
            Err(StreamError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_overlong_line_is_malformed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"data: ");
        decoder.feed(&vec![b'a'; MAX_LINE_BYTES + 1]);
        assert!(matches!(
            decoder.next_payload(),
            Err(StreamError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_unterminated_event_is_bounded() {
        let mut decoder = FrameDecoder::new();
        let line = format!("data: {}\n", "x".repeat(64 * 1024));
        let mut result = Ok(None);
        for _ in 0..(MAX_EVENT_BYTES / (64 * 1024) + 2) {
            decoder.feed(line.as_bytes());
            result = decoder.next_payload();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(StreamError::MalformedFrame(_))));
    }

    #[test]
    fn test_parse_payload_forms() {
        assert_eq!(parse_payload("").unwrap(), None);
        assert_eq!(parse_payload("   ").unwrap(), None);

        let done = parse_payload("[DONE]").unwrap().unwrap();
        assert!(done.terminal);
        assert!(done.chunk.is_finished);

        let text = parse_payload("message_1").unwrap().unwrap();
        assert_eq!(text.chunk, CompletionChunk::delta("message_1"));
        assert!(!text.terminal);

        let json = parse_payload(r#"{"delta":"Hi","isFinished":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(json.chunk.delta, "Hi");
        assert!(!json.terminal);

        let finished = parse_payload(r#"{"delta":"","isFinished":true}"#)
            .unwrap()
            .unwrap();
        assert!(finished.terminal);
    }

    #[test]
    fn test_parse_payload_invalid_json_is_malformed() {
        assert!(matches!(
            parse_payload("{invalid"),
            Err(StreamError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_encode_data_frame() {
        let frame = encode_data_frame(br#"{"delta":"a","isFinished":false}"#);
        assert_eq!(&frame[..], b"data: {\"delta\":\"a\",\"isFinished\":false}\n\n");
    }
}
