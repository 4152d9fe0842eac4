use agentwire_core::error::DiscoveryError;
use agentwire_core::ndjson::DecodeError;

use crate::subprocess::ProcessError;

/// Errors from transport operations and the receive path.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Transport is already connected")]
    AlreadyConnected,

    #[error("Transport is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    /// Cancelled after the line was handed to the writer; it is still
    /// written.
    #[error("Operation cancelled after the line was queued")]
    CancelledInFlight,

    #[error("Message stream was already taken")]
    StreamTaken,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Agent process exited unexpectedly (code {code:?}){}", stderr_suffix(.stderr))]
    ProcessExited { code: Option<i32>, stderr: String },

    #[error("Failed to write to agent stdin: {0}")]
    WriteFailed(String),
}

impl TransportError {
    /// Whether the transport is unusable after this error.
    ///
    /// Decode and serialize errors concern a single message and
    /// cancellation concerns a single call; everything else means the
    /// process or its pipes are gone.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Decode(_) | Self::Serialize(_) | Self::Cancelled | Self::CancelledInFlight
        )
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}
