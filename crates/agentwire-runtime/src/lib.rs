//! agentwire Runtime Library
//!
//! Drives a long-lived agent CLI over stream-json:
//! - Subprocess lifecycle with graceful-then-forced termination
//! - Transport: decoded message/error streams, serialized line writes
//! - Query handles: one outstanding request's status, stream and outcome
//! - Session queues: per-session FIFO with a single-concurrency worker

pub mod query;
pub mod queue;
pub mod subprocess;
pub mod transport;

#[cfg(test)]
mod testing;

pub use query::{QueryError, QueryHandle, QueryStatus};
pub use queue::{MessageStatus, QueueError, QueueManager, QueueStats, QueuedMessage};
pub use subprocess::{AgentProcess, GRACE_PERIOD, ProcessError, ProcessState};
pub use transport::{
    MessageStream, SubprocessTransport, SubprocessTransportFactory, Transport, TransportError,
    TransportFactory,
};
