//! Line framing of the streamed chat response
//!
//! The body is a sequence of lines; every line starting with `data:` carries
//! one JSON event. Everything else is ignored.

use serde::Deserialize;
use serde_json::Value;

const DATA_MARKER: &str = "data:";

/// One event sent by the backend while a reply streams
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A new assistant reply begins
    Start,
    /// Text to append to the reply
    Chunk { content: String },
    /// The reply is finished
    Complete {
        #[serde(default)]
        full_message: Option<String>,
    },
    /// The backend failed to produce a reply
    Error {
        #[serde(default)]
        message: String,
    },
}

/// A decoded `data:` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(StreamEvent),
    /// Payload that is not a known event; callers skip it
    Malformed { payload: String, error: String },
}

/// Incremental splitter turning raw body bytes into frames
///
/// Bytes are buffered until a newline arrives, so UTF-8 sequences and JSON
/// payloads split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning frames for every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(&line[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that had no newline at end of stream
    pub fn finish(&mut self) -> Vec<Frame> {
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line).into_iter().collect()
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<Frame> {
    let line = String::from_utf8_lossy(line);
    let line = line.strip_suffix('\r').unwrap_or(&line[..]);
    let payload = line.strip_prefix(DATA_MARKER)?.trim();

    Some(match parse_event(payload) {
        Ok(event) => Frame::Event(event),
        Err(e) => Frame::Malformed {
            payload: payload.to_string(),
            error: e.to_string(),
        },
    })
}

/// Parse one event payload
///
/// Validation failures arrive as a bare `{"error": "..."}` without a type
/// and are read as [`StreamEvent::Error`].
pub fn parse_event(payload: &str) -> serde_json::Result<StreamEvent> {
    let value: Value = serde_json::from_str(payload)?;
    if value.get("type").is_none() {
        if let Some(message) = value.get("error").and_then(Value::as_str) {
            return Ok(StreamEvent::Error {
                message: message.to_string(),
            });
        }
    }
    serde_json::from_value(value)
}
