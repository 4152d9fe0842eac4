//! Per-session worker loop.
//!
//! Each session gets one worker task. It owns that session's transport,
//! creating it lazily on first dispatch and recreating it after a fatal
//! error, and runs at most one query at a time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use agentwire_core::config::QueueConfig;
use agentwire_core::ndjson::StreamMessage;

use super::session::SessionQueue;
use super::types::QueuedMessage;
use crate::query::{QueryError, TurnEnd, drain_turn, execute};
use crate::transport::{MessageStream, Transport, TransportError, TransportFactory};

struct Link {
    transport: Arc<dyn Transport>,
    stream: MessageStream,
}

pub(crate) struct Worker {
    queue: Arc<SessionQueue>,
    factory: Arc<dyn TransportFactory>,
    config: QueueConfig,
    link: Option<Link>,
}

impl Worker {
    pub(crate) fn new(
        queue: Arc<SessionQueue>,
        factory: Arc<dyn TransportFactory>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            factory,
            config,
            link: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let session_id = self.queue.session_id.clone();
        info!(%session_id, "Session worker started");

        loop {
            if self.queue.shutdown.is_cancelled() {
                break;
            }
            let next = self.queue.state.lock().await.next_dispatch();
            let Some(message) = next else {
                tokio::select! {
                    () = self.queue.notify.notified() => {}
                    () = tokio::time::sleep(self.config.poll_interval()) => {}
                    () = self.queue.shutdown.cancelled() => break,
                }
                continue;
            };

            self.dispatch(&message).await;

            if !message.handle.is_done() {
                message.handle.fail(QueryError::StreamClosed);
            }
            let finished = self.queue.state.lock().await.finish_processing();
            if let Some(done) = finished {
                info!(
                    %session_id,
                    message_id = %done.id,
                    status = ?done.status,
                    "Message finished"
                );
            }
        }

        let unfinished = self.queue.state.lock().await.drain_unfinished();
        for message in unfinished {
            message.handle.cancel_with(QueryError::ShuttingDown);
        }
        self.drop_link().await;
        info!(%session_id, "Session worker stopped");
    }

    async fn dispatch(&mut self, message: &QueuedMessage) {
        let handle = &message.handle;
        if !handle.mark_processing() {
            debug!(message_id = %message.id, "Message finished before dispatch");
            return;
        }
        info!(
            session_id = %self.queue.session_id,
            message_id = %message.id,
            "Dispatching message"
        );

        if let Err(e) = self.ensure_link().await {
            warn!(session_id = %self.queue.session_id, error = %e, "Failed to start transport");
            handle.fail(QueryError::Transport(e.to_string()));
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        let request = StreamMessage::user(&self.queue.session_id, &message.content);
        let end = execute(
            handle,
            link.transport.as_ref(),
            &mut link.stream,
            &request,
            &self.queue.shutdown,
        )
        .await;

        match end {
            TurnEnd::Finished | TurnEnd::Skipped => {}
            TurnEnd::Cancelled => {
                if self.queue.shutdown.is_cancelled() {
                    return;
                }
                let clean = drain_turn(
                    link.transport.as_ref(),
                    &mut link.stream,
                    self.config.drain_timeout(),
                    &self.queue.shutdown,
                )
                .await;
                if !clean {
                    self.drop_link().await;
                }
            }
            TurnEnd::Broken => self.drop_link().await,
        }
    }

    async fn ensure_link(&mut self) -> Result<(), TransportError> {
        if let Some(ref link) = self.link {
            if link.transport.is_connected() {
                return Ok(());
            }
            debug!(session_id = %self.queue.session_id, "Transport disconnected, recreating");
            self.drop_link().await;
        }

        let transport = self.factory.create(&self.queue.session_id)?;
        let shutdown = &self.queue.shutdown;
        let stream = match transport.connect(shutdown).await {
            Ok(()) => transport.receive(shutdown).await,
            Err(e) => Err(e),
        };
        match stream {
            Ok(stream) => {
                self.link = Some(Link { transport, stream });
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!(error = %close_err, "Error closing failed transport");
                }
                Err(e)
            }
        }
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take()
            && let Err(e) = link.transport.close().await
        {
            warn!(session_id = %self.queue.session_id, error = %e, "Error closing transport");
        }
    }
}
