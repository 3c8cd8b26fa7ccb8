//! Line-oriented framing for the server's push stream.
//!
//! Each message is an optional `event: <type>` line, one or more
//! `data: <chunk>` lines, and a blank-line terminator. Data chunks of one
//! message are joined with `\n` in arrival order. A message is emitted only
//! when it has both a type and a non-empty payload; type and payload reset
//! at every blank line either way.

use droidpilot_core::error::TransportError;
use droidpilot_core::event::{EventKind, RawEvent};

/// Longest line accepted before the peer is treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits an arbitrary byte stream into complete lines.
///
/// Bytes are buffered until a `\n` arrives so that multi-byte UTF-8
/// sequences split across network chunks are decoded intact.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
        }
    }

    /// Append bytes and drain every complete line (without `\r\n`/`\n`).
    ///
    /// Fails with [`TransportError::Read`] once an unterminated line grows
    /// past the limit; the buffer is emptied in that case.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, TransportError> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = self.buf[start..end]
                .strip_suffix(b"\r")
                .unwrap_or(&self.buf[start..end]);
            lines.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > self.max_line {
            let len = self.buf.len();
            self.buf.clear();
            return Err(TransportError::Read(format!(
                "line exceeds {} bytes without a terminator ({len} buffered)",
                self.max_line
            )));
        }
        Ok(lines)
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Reassembles framed lines into [`RawEvent`]s.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the wire; returns every event they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RawEvent>, TransportError> {
        let lines = self.lines.push(bytes)?;
        Ok(lines
            .into_iter()
            .filter_map(|line| self.push_line(&line))
            .collect())
    }

    /// Process one line. Returns an event when the line is the blank
    /// delimiter closing a complete message.
    pub fn push_line(&mut self, line: &str) -> Option<RawEvent> {
        let line = line.trim();

        if line.is_empty() {
            let event = self.event.take();
            let payload = self.data.join("\n");
            self.data.clear();

            return match event {
                Some(kind) if !payload.is_empty() => {
                    Some(RawEvent::new(EventKind::parse(&kind), payload))
                }
                _ => None,
            };
        }

        if let Some(rest) = line.strip_prefix("event:") {
            let kind = rest.trim();
            self.event = (!kind.is_empty()).then(|| kind.to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.trim().to_string());
        }
        // Comments (`:`), `id:` and `retry:` fields carry nothing we route on.

        None
    }

    /// Whether a message has started but not been terminated yet.
    pub fn has_partial(&self) -> bool {
        self.event.is_some() || !self.data.is_empty() || self.lines.pending() > 0
    }

    /// Drop any unterminated message, e.g. when the connection ends.
    pub fn reset(&mut self) {
        self.lines = LineBuffer::new();
        self.event = None;
        self.data.clear();
    }
}
