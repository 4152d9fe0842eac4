//! Decode failures surfaced by the stream decoder.

use thiserror::Error;

/// A unit of input that could not be turned into a [`Message`](super::Message).
///
/// Every variant except `Overflow` carries the offending raw data so the
/// caller can log or replay it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer hit its ceiling without yielding a complete value and was
    /// discarded.
    #[error("Stream buffer exceeded {limit} bytes without a complete JSON value")]
    Overflow { limit: usize },

    /// Bytes that can never become JSON were skipped.
    #[error("Malformed JSON: {reason}")]
    Syntax { reason: String, raw: String },

    /// Well-formed JSON that is not a known protocol message.
    #[error("Invalid message: {reason}")]
    Invalid { reason: String, raw: String },
}

impl DecodeError {
    /// The raw payload attached to this error, if any.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::Overflow { .. } => None,
            Self::Syntax { raw, .. } | Self::Invalid { raw, .. } => Some(raw),
        }
    }
}
