//! SSE (Server-Sent Events) decoder
//!
//! Turns the `text/event-stream` wire format into [`Frame`] values. The
//! decoder is fed raw chunks as they arrive from the network, so lines and
//! UTF-8 sequences may be split anywhere.

use tracing::{debug, trace};

/// Event type used when a frame carries no `event:` field
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// One decoded event from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `event:` field, `"message"` when absent
    pub event_type: String,
    /// All `data:` lines joined with `\n`
    pub data: String,
    /// Value of the `id:` field set within this frame
    pub id: Option<String>,
}

impl Frame {
    /// Build a frame with the default event type and no id
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
            id: None,
        }
    }
}

/// Incremental decoder state, one per connection
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of the line currently being received
    buffer: Vec<u8>,
    /// Data lines of the frame being built
    data_buffer: String,
    /// Whether at least one data line was seen (data may be empty)
    has_data: bool,
    /// Event type of the frame being built
    event_type: Option<String>,
    /// Id set within the frame being built
    frame_id: Option<String>,
    /// Set when a line of this frame was not valid UTF-8
    poisoned: bool,
    /// Last id seen on this connection, kept across frames
    last_event_id: Option<String>,
}

impl SseDecoder {
    /// Create a new decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` value seen, used for `Last-Event-ID` on reconnect
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed bytes into the decoder and extract any complete frames
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            let line = &line[..line.len() - 1];

            // Handle \r\n line endings
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Discard whatever is left when the connection closes
    ///
    /// A frame without its terminating blank line is never emitted.
    pub fn finish(self) -> Option<String> {
        if !self.buffer.is_empty() || self.has_data {
            debug!(
                pending_bytes = self.buffer.len(),
                "Discarding partial SSE frame at end of stream"
            );
        }
        self.last_event_id
    }

    fn process_line(&mut self, line: &[u8]) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }

        // Comment line (keepalive)
        if line.starts_with(b":") {
            trace!("SSE comment");
            return None;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            debug!("Invalid UTF-8 in SSE line, dropping frame");
            self.poisoned = true;
            return None;
        };

        // Split on first colon, a field with no colon has an empty value
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data_buffer.push('\n');
                }
                self.data_buffer.push_str(value);
                self.has_data = true;
            }
            "event" => {
                self.event_type = Some(value.to_string());
            }
            "id" => {
                if value.contains('\0') {
                    trace!("SSE id with NUL ignored");
                } else {
                    self.frame_id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                // Reconnect timing is owned by the backoff policy
                trace!("SSE retry ignored: {}", value);
            }
            _ => {
                trace!("SSE unknown field: {}", field);
            }
        }

        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        let data = std::mem::take(&mut self.data_buffer);
        let has_data = std::mem::replace(&mut self.has_data, false);
        let event_type = self.event_type.take();
        let id = self.frame_id.take();
        let poisoned = std::mem::replace(&mut self.poisoned, false);

        if poisoned || !has_data {
            return None;
        }

        Some(Frame {
            event_type: event_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data,
            id,
        })
    }
}
