//! Transport between the queue layer and one agent CLI process.
//!
//! A [`Transport`] owns exactly one process. `connect` wires its stdout
//! through the stream decoder into a [`MessageStream`]; `send` writes one
//! protocol line; `close` stops the read loop and runs the termination
//! protocol.

mod error;
mod subprocess;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentwire_core::ndjson::{Message, StreamMessage};

pub use error::TransportError;
pub use subprocess::{SubprocessTransport, SubprocessTransportFactory};

/// Decoded output of a transport, in arrival order.
///
/// Both receivers close exactly once, when the read loop exits.
#[derive(Debug)]
pub struct MessageStream {
    pub messages: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<TransportError>,
}

/// Bidirectional message channel to an agent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the process and its read loop.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Write one message as a single line.
    async fn send(
        &self,
        message: &StreamMessage,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Take the decoded message and error streams. Available once per
    /// connection.
    async fn receive(&self, cancel: &CancellationToken) -> Result<MessageStream, TransportError>;

    /// Ask the agent to abandon its current turn without stopping the
    /// process.
    async fn interrupt(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Stop the read loop and terminate the process. Later calls are no-ops.
    async fn close(&self) -> Result<(), TransportError>;

    /// Whether the process is running and its read loop is alive.
    fn is_connected(&self) -> bool;
}

/// Creates one transport per session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
