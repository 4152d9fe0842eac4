//! Speculative stream decoder for the CLI's stdout.
//!
//! Writes from the subprocess are not message-aligned: one read may hold
//! half a message, several messages, or a message whose string values
//! contain escaped newlines. [`StreamDecoder`] appends every fragment to a
//! bounded buffer and repeatedly tries to parse one complete JSON value off
//! its front:
//!
//! - a complete value is validated, emitted, and only its bytes are removed;
//! - an "unexpected end of input" error means the value is still arriving,
//!   so the bytes stay buffered for the next fragment;
//! - bytes that can never become JSON are skipped up to the next line (or
//!   the next `{` if no line break has arrived yet) and reported;
//! - a buffer that reaches its ceiling without yielding a value is dropped
//!   and reported as [`DecodeError::Overflow`].
//!
//! The decoder never blocks and never fails as a whole; every problem is a
//! per-unit error and decoding continues with the next byte.

use serde_json::Value;
use tracing::{debug, warn};

use super::error::DecodeError;
use super::parser::message_from_value;
use super::types::Message;

/// Default ceiling for the raw buffer (1 MiB).
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Incremental decoder from raw stdout bytes to protocol messages.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    max_size: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    /// Create a decoder with the default 1 MiB ceiling.
    pub const fn new() -> Self {
        Self::with_max_size(MAX_BUFFER_SIZE)
    }

    /// Create a decoder with a custom ceiling. Zero selects the default.
    pub const fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size: if max_size == 0 {
                MAX_BUFFER_SIZE
            } else {
                max_size
            },
        }
    }

    /// Bytes currently held waiting for the rest of a value.
    pub const fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Discard any partially received value.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed one fragment and collect every result it completes, in order.
    ///
    /// The fragment is appended in slices no larger than the remaining
    /// room, so the buffer never grows past the ceiling even when a single
    /// fragment is larger than it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Message, DecodeError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let room = self.max_size - self.buffer.len();
            if room == 0 {
                warn!(
                    limit = self.max_size,
                    "Stream buffer overflow, discarding buffered bytes"
                );
                self.buffer.clear();
                out.push(Err(DecodeError::Overflow {
                    limit: self.max_size,
                }));
                continue;
            }

            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.buffer.extend_from_slice(head);
            rest = tail;
            self.drain(&mut out);
        }

        out
    }

    /// Flush at end of input. Leftover bytes can no longer complete, so
    /// they are reported as a truncated value.
    pub fn finish(&mut self) -> Option<DecodeError> {
        let leftover = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if leftover.is_empty() {
            return None;
        }
        Some(DecodeError::Syntax {
            reason: "stream ended inside a JSON value".to_string(),
            raw: leftover,
        })
    }

    fn drain(&mut self, out: &mut Vec<Result<Message, DecodeError>>) {
        loop {
            let start = self
                .buffer
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..start);
            if self.buffer.is_empty() {
                return;
            }

            let (next, consumed) = {
                let mut values = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
                let next = values.next();
                (next, values.byte_offset())
            };

            match next {
                None => {
                    self.buffer.clear();
                    return;
                }
                Some(Ok(value)) => {
                    let decoded = message_from_value(value).map_err(|reason| {
                        let raw = String::from_utf8_lossy(&self.buffer[..consumed]).into_owned();
                        debug!(%reason, "Rejected stream message");
                        DecodeError::Invalid { reason, raw }
                    });
                    self.buffer.drain(..consumed);
                    out.push(decoded);
                }
                Some(Err(e)) if e.is_eof() => return,
                Some(Err(e)) => {
                    let Some(cut) = self.resync_point(&e) else {
                        // No boundary yet; keep accumulating until one
                        // arrives or the ceiling is hit.
                        return;
                    };
                    let raw = String::from_utf8_lossy(&self.buffer[..cut])
                        .trim_end()
                        .to_string();
                    debug!(error = %e, skipped = cut, "Skipping malformed stream bytes");
                    self.buffer.drain(..cut);
                    out.push(Err(DecodeError::Syntax {
                        reason: e.to_string(),
                        raw,
                    }));
                }
            }
        }
    }

    /// Where to cut after a hard syntax error. A value broken off by a
    /// line break is cut at that break so the next line survives;
    /// otherwise just past the first line break at or after the error,
    /// else at the next `{`.
    fn resync_point(&self, err: &serde_json::Error) -> Option<usize> {
        let at = error_offset(&self.buffer, err.line(), err.column());

        if let Some(nl) = self.buffer[..at].iter().rposition(|b| *b == b'\n') {
            return Some(nl + 1);
        }
        if let Some(nl) = self.buffer[at..].iter().position(|b| *b == b'\n') {
            return Some(at + nl + 1);
        }
        let from = at.max(1);
        self.buffer
            .get(from..)?
            .iter()
            .position(|b| *b == b'{')
            .map(|p| from + p)
    }
}

/// Translate serde_json's one-based line/column into a byte offset.
fn error_offset(buf: &[u8], line: usize, column: usize) -> usize {
    let mut line_start = 0;
    let mut remaining = line.saturating_sub(1);
    if remaining > 0 {
        for (i, b) in buf.iter().enumerate() {
            if *b == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    line_start = i + 1;
                    break;
                }
            }
        }
    }
    (line_start + column.saturating_sub(1)).min(buf.len())
}
