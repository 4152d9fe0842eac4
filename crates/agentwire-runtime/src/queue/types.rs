//! Queue module types.

use std::time::SystemTime;

use crate::query::{QueryError, QueryHandle, QueryStatus};

/// Status of a message in a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    /// Taken out of the queue before dispatch.
    Removed,
}

impl MessageStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }
}

impl From<QueryStatus> for MessageStatus {
    fn from(status: QueryStatus) -> Self {
        match status {
            QueryStatus::Queued => Self::Queued,
            QueryStatus::Processing => Self::Processing,
            QueryStatus::Completed => Self::Completed,
            QueryStatus::Failed => Self::Failed,
            QueryStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// A message submitted to a session queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Message ID; equal to the handle's query ID.
    pub id: String,
    pub session_id: String,
    /// Prompt text sent as the user turn.
    pub content: String,
    /// Higher values dispatch first; equal priorities are FIFO.
    pub priority: i32,
    pub enqueued_at: SystemTime,
    pub status: MessageStatus,
    pub handle: QueryHandle,
    /// Failure or cancellation reason once finished.
    pub error: Option<QueryError>,
}

/// Snapshot of one session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub session_id: String,
    pub pending: usize,
    /// ID of the message being processed, if any.
    pub processing: Option<String>,
    pub paused: bool,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Message is already processing: {message_id}")]
    AlreadyProcessing { message_id: String },

    #[error("Invalid reorder: {reason}")]
    InvalidReorder { reason: String },

    #[error("Queue manager is shutting down")]
    ShuttingDown,

    #[error("Workers did not stop in time and were aborted: {}", abandoned.join(", "))]
    ShutdownTimeout { abandoned: Vec<String> },
}
