//! Running one query over a connected transport.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentwire_core::ndjson::{Message, StreamMessage};

use super::handle::{QueryError, QueryHandle};
use crate::transport::{MessageStream, Transport, TransportError};

/// How a turn ended, from the transport's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnEnd {
    /// A result message arrived; the stream is positioned at the next turn.
    Finished,
    /// Nothing was sent; the stream is still at a turn boundary.
    Skipped,
    /// Cancelled mid-turn; leftover output may still arrive.
    Cancelled,
    /// The transport is unusable.
    Broken,
}

/// Send `message` and forward the reply to `handle` until the turn's
/// result message, cancellation, or a fatal transport error.
///
/// The handle is in a terminal state when this returns.
pub(crate) async fn execute(
    handle: &QueryHandle,
    transport: &dyn Transport,
    stream: &mut MessageStream,
    message: &StreamMessage,
    shutdown: &CancellationToken,
) -> TurnEnd {
    let cancel = handle.cancellation_token();
    if cancel.is_cancelled() {
        finish_cancelled(handle, shutdown);
        return TurnEnd::Skipped;
    }

    match transport.send(message, &cancel).await {
        Ok(()) => {}
        Err(TransportError::Cancelled) => {
            finish_cancelled(handle, shutdown);
            return TurnEnd::Skipped;
        }
        Err(TransportError::CancelledInFlight) => {
            finish_cancelled(handle, shutdown);
            return TurnEnd::Cancelled;
        }
        Err(e) => {
            handle.fail(QueryError::Transport(e.to_string()));
            return if e.is_fatal() {
                TurnEnd::Broken
            } else {
                TurnEnd::Finished
            };
        }
    }

    let mut errors_open = true;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                finish_cancelled(handle, shutdown);
                return TurnEnd::Cancelled;
            }
            received = stream.messages.recv() => match received {
                Some(Message::ControlResponse(resp)) => {
                    debug!(query_id = %handle.id(), request_id = ?resp.request_id, "Ignoring stray control response");
                }
                Some(msg) => {
                    let done = msg.is_result();
                    handle.forward(msg).await;
                    if done {
                        handle.complete();
                        return TurnEnd::Finished;
                    }
                }
                None => {
                    let cause = closing_error(stream).map_or(QueryError::StreamClosed, |e| {
                        QueryError::Transport(e.to_string())
                    });
                    handle.fail(cause);
                    return TurnEnd::Broken;
                }
            },
            failure = stream.errors.recv(), if errors_open => match failure {
                Some(e) if e.is_fatal() => {
                    handle.fail(QueryError::Transport(e.to_string()));
                    return TurnEnd::Broken;
                }
                Some(e) => {
                    warn!(query_id = %handle.id(), error = %e, "Recoverable error during query");
                    handle.record_error(QueryError::Transport(e.to_string()));
                }
                None => errors_open = false,
            },
        }
    }
}

/// Interrupt the agent and discard output until the interrupted turn's
/// result message. Returns `false` if the stream could not be brought back
/// to a turn boundary within `timeout`.
pub(crate) async fn drain_turn(
    transport: &dyn Transport,
    stream: &mut MessageStream,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> bool {
    if let Err(e) = transport.interrupt(shutdown).await {
        warn!(error = %e, "Failed to interrupt agent");
        return false;
    }

    let drained = tokio::time::timeout(timeout, async {
        let mut errors_open = true;
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                received = stream.messages.recv() => match received {
                    Some(msg) if msg.is_result() => return true,
                    Some(msg) => debug!(kind = msg.kind(), "Discarding output of cancelled turn"),
                    None => return false,
                },
                failure = stream.errors.recv(), if errors_open => match failure {
                    Some(e) if e.is_fatal() => return false,
                    Some(_) => {}
                    None => errors_open = false,
                },
            }
        }
    })
    .await;

    match drained {
        Ok(clean) => clean,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis(), "Timed out draining cancelled turn");
            false
        }
    }
}

fn finish_cancelled(handle: &QueryHandle, shutdown: &CancellationToken) {
    let reason = if shutdown.is_cancelled() {
        QueryError::ShuttingDown
    } else {
        QueryError::Cancelled
    };
    handle.cancel_with(reason);
}

/// The fatal error that explains a closed message stream, if one was
/// queued.
fn closing_error(stream: &mut MessageStream) -> Option<TransportError> {
    while let Ok(e) = stream.errors.try_recv() {
        if e.is_fatal() {
            return Some(e);
        }
    }
    None
}
