//! Caller-facing handle for one submitted unit of work.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agentwire_core::ndjson::Message;

/// Messages buffered per handle before an untaken stream starts dropping.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueryStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Why a query did not complete, or a non-fatal problem seen while it ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Query cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message stream closed before the turn completed")]
    StreamClosed,

    #[error("Queue is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
struct State {
    status: QueryStatus,
    /// First error recorded, fatal or not.
    error: Option<QueryError>,
    /// Outcome reported by `wait` for Failed/Cancelled.
    failure: Option<QueryError>,
}

struct Inner {
    id: String,
    session_id: String,
    state: watch::Sender<State>,
    messages_tx: Mutex<Option<mpsc::Sender<Message>>>,
    messages_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    stream_taken: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to one query: its status, message stream, and outcome.
///
/// Cheap to clone; all clones observe the same query. Every terminal
/// transition happens exactly once, and on that transition the message
/// stream is closed.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl QueryHandle {
    /// Create a queued handle. `cancel` is typically a child of the owning
    /// session's token so shutdown reaches every query.
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_capacity(id, session_id, cancel, DEFAULT_STREAM_CAPACITY)
    }

    pub fn with_capacity(
        id: impl Into<String>,
        session_id: impl Into<String>,
        cancel: CancellationToken,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                session_id: session_id.into(),
                state: watch::Sender::new(State {
                    status: QueryStatus::Queued,
                    error: None,
                    failure: None,
                }),
                messages_tx: Mutex::new(Some(tx)),
                messages_rx: Mutex::new(Some(rx)),
                stream_taken: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.state.borrow().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// The first error recorded on this query, if any.
    pub fn error(&self) -> Option<QueryError> {
        self.inner.state.borrow().error.clone()
    }

    /// Why the query failed or was cancelled. `None` while running and
    /// after completion.
    pub fn failure(&self) -> Option<QueryError> {
        self.inner.state.borrow().failure.clone()
    }

    /// Token observed by whoever executes this query.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Take the message stream. Only the first call gets it.
    ///
    /// Once taken, forwarding applies backpressure instead of dropping.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<Message>> {
        let rx = self
            .inner
            .messages_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if rx.is_some() {
            self.inner.stream_taken.store(true, Ordering::SeqCst);
        }
        rx
    }

    /// Block until the query reaches a terminal state.
    ///
    /// Repeated and concurrent calls return the same outcome.
    pub async fn wait(&self) -> Result<(), QueryError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| QueryError::StreamClosed)?
            .clone();
        match state.status {
            QueryStatus::Completed => Ok(()),
            QueryStatus::Cancelled => Err(state.failure.unwrap_or(QueryError::Cancelled)),
            _ => Err(state.failure.unwrap_or(QueryError::StreamClosed)),
        }
    }

    /// Cancel the query. Returns `true` for the call that performed the
    /// transition; later calls and calls after completion are no-ops.
    pub fn cancel(&self) -> bool {
        self.cancel_with(QueryError::Cancelled)
    }

    pub(crate) fn cancel_with(&self, reason: QueryError) -> bool {
        let changed = self.finish(QueryStatus::Cancelled, Some(reason));
        self.inner.cancel.cancel();
        if changed {
            info!(query_id = %self.inner.id, session_id = %self.inner.session_id, "Query cancelled");
        }
        changed
    }

    /// Queued -> Processing. Fails if the query already finished.
    pub(crate) fn mark_processing(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if s.status == QueryStatus::Queued {
                s.status = QueryStatus::Processing;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn complete(&self) -> bool {
        self.finish(QueryStatus::Completed, None)
    }

    pub(crate) fn fail(&self, error: QueryError) -> bool {
        let changed = self.finish(QueryStatus::Failed, Some(error));
        if changed {
            warn!(
                query_id = %self.inner.id,
                error = ?self.failure(),
                "Query failed"
            );
        }
        changed
    }

    /// Record a non-fatal error. Only the first one is kept.
    pub(crate) fn record_error(&self, error: QueryError) {
        self.inner.state.send_if_modified(|s| {
            if s.error.is_none() && !s.status.is_terminal() {
                s.error = Some(error);
                true
            } else {
                false
            }
        });
    }

    /// Move to a terminal state exactly once and close the stream.
    fn finish(&self, status: QueryStatus, error: Option<QueryError>) -> bool {
        let changed = self.inner.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = status;
            if s.error.is_none() {
                s.error.clone_from(&error);
            }
            s.failure = error;
            true
        });
        if changed {
            drop(
                self.inner
                    .messages_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            debug!(query_id = %self.inner.id, ?status, "Query finished");
        }
        changed
    }

    /// Deliver one message to the stream.
    ///
    /// A taken stream gets backpressure until the query is cancelled. An
    /// untaken one buffers up to its capacity and drops the rest.
    pub(crate) async fn forward(&self, message: Message) -> bool {
        let tx = self
            .inner
            .messages_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = tx else {
            return false;
        };

        if self.inner.stream_taken.load(Ordering::SeqCst) {
            tokio::select! {
                sent = tx.send(message) => sent.is_ok(),
                () = self.inner.cancel.cancelled() => false,
            }
        } else {
            match tx.try_send(message) {
                Ok(()) => true,
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        query_id = %self.inner.id,
                        kind = dropped.kind(),
                        "Query stream full and not consumed, dropping message"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        }
    }
}
