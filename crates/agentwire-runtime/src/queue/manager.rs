//! Session queue manager.
//!
//! Routes messages to per-session queues, each drained by its own worker.
//! Every mutating operation takes only the target session's lock and never
//! waits on a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentwire_core::config::QueueConfig;

use super::session::SessionQueue;
use super::types::{MessageStatus, QueueError, QueueStats, QueuedMessage};
use super::worker::Worker;
use crate::query::{QueryError, QueryHandle};
use crate::transport::TransportFactory;

struct SessionEntry {
    queue: Arc<SessionQueue>,
    worker: JoinHandle<()>,
}

/// Manages one queue and one worker per session.
pub struct QueueManager {
    factory: Arc<dyn TransportFactory>,
    config: QueueConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl QueueManager {
    pub fn new(factory: Arc<dyn TransportFactory>, config: QueueConfig) -> Self {
        Self {
            factory,
            config,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `content` for `session_id` at default priority.
    pub async fn enqueue(
        &self,
        session_id: &str,
        content: impl Into<String>,
    ) -> Result<QueryHandle, QueueError> {
        self.enqueue_with_priority(session_id, content, 0).await
    }

    /// Queue `content` for `session_id`. Higher priorities dispatch first;
    /// equal priorities are FIFO. The session is created on first use.
    pub async fn enqueue_with_priority(
        &self,
        session_id: &str,
        content: impl Into<String>,
        priority: i32,
    ) -> Result<QueryHandle, QueueError> {
        let queue = self.session_or_create(session_id).await?;
        let id = Uuid::new_v4().to_string();
        let handle = QueryHandle::new(id.clone(), session_id, queue.shutdown.child_token());
        let message = QueuedMessage {
            id: id.clone(),
            session_id: session_id.to_string(),
            content: content.into(),
            priority,
            enqueued_at: SystemTime::now(),
            status: MessageStatus::Queued,
            handle: handle.clone(),
            error: None,
        };

        queue.state.lock().await.enqueue(message);
        if queue.shutdown.is_cancelled() {
            // The session was removed after lookup; its worker is gone.
            handle.cancel_with(QueryError::ShuttingDown);
            return Err(QueueError::ShuttingDown);
        }
        queue.notify.notify_one();
        debug!(session_id, message_id = %id, priority, "Message enqueued");
        Ok(handle)
    }

    /// Remove a pending message and cancel its handle. Fails if the
    /// message is already processing.
    pub async fn remove_from_queue(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<QueuedMessage, QueueError> {
        let queue = self.session(session_id).await?;
        let removed = queue.state.lock().await.remove(message_id)?;
        removed.handle.cancel();
        info!(session_id, message_id, "Message removed from queue");
        Ok(removed)
    }

    /// Remove every pending message. The in-flight message keeps running.
    pub async fn clear_queue(&self, session_id: &str) -> Result<usize, QueueError> {
        let queue = self.session(session_id).await?;
        let removed = queue.state.lock().await.clear();
        for message in &removed {
            message.handle.cancel();
        }
        info!(session_id, count = removed.len(), "Queue cleared");
        Ok(removed.len())
    }

    /// Set the dispatch order of the pending messages. `order` must list
    /// every pending message ID exactly once.
    pub async fn reorder(&self, session_id: &str, order: &[String]) -> Result<(), QueueError> {
        let queue = self.session(session_id).await?;
        queue.state.lock().await.reorder(order)?;
        debug!(session_id, "Queue reordered");
        Ok(())
    }

    pub async fn set_priority(
        &self,
        session_id: &str,
        message_id: &str,
        priority: i32,
    ) -> Result<(), QueueError> {
        let queue = self.session(session_id).await?;
        queue.state.lock().await.set_priority(message_id, priority)?;
        debug!(session_id, message_id, priority, "Priority changed");
        Ok(())
    }

    /// Stop dispatching for `session_id`. The in-flight message, if any,
    /// runs to completion. Creates the session if it does not exist.
    pub async fn pause(&self, session_id: &str) -> Result<(), QueueError> {
        let queue = self.session_or_create(session_id).await?;
        queue.state.lock().await.set_paused(true);
        info!(session_id, "Queue paused");
        Ok(())
    }

    /// Resume dispatching in the existing pending order.
    pub async fn resume(&self, session_id: &str) -> Result<(), QueueError> {
        let queue = self.session(session_id).await?;
        queue.state.lock().await.set_paused(false);
        queue.notify.notify_one();
        info!(session_id, "Queue resumed");
        Ok(())
    }

    /// Look up a message: pending, processing, or in recent history.
    pub async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<QueuedMessage, QueueError> {
        let queue = self.session(session_id).await?;
        let found = queue.state.lock().await.get(message_id);
        found.ok_or_else(|| QueueError::MessageNotFound {
            message_id: message_id.to_string(),
        })
    }

    /// Pending messages in dispatch order.
    pub async fn list_pending(&self, session_id: &str) -> Result<Vec<QueuedMessage>, QueueError> {
        let queue = self.session(session_id).await?;
        let pending = queue.state.lock().await.pending();
        Ok(pending)
    }

    /// Finished and removed messages, oldest first, bounded by
    /// `history_limit`.
    pub async fn history(&self, session_id: &str) -> Result<Vec<QueuedMessage>, QueueError> {
        let queue = self.session(session_id).await?;
        let history = queue.state.lock().await.history();
        Ok(history)
    }

    pub async fn queue_status(&self, session_id: &str) -> Result<QueueStats, QueueError> {
        let queue = self.session(session_id).await?;
        let stats = queue.state.lock().await.stats(session_id);
        Ok(stats)
    }

    /// IDs of all live sessions, sorted.
    pub async fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop one session's worker, cancel its pending messages, and close
    /// its transport.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), QueueError> {
        let entry = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| QueueError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;

        entry.queue.shutdown.cancel();
        let abandoned = self
            .join_workers(vec![(session_id.to_string(), entry)])
            .await;
        info!(session_id, "Session removed");
        if abandoned.is_empty() {
            Ok(())
        } else {
            Err(QueueError::ShutdownTimeout { abandoned })
        }
    }

    /// Stop all workers and wait for them, bounded by
    /// `shutdown_timeout_secs`.
    ///
    /// Workers still running at the deadline are aborted and reported as
    /// [`QueueError::ShutdownTimeout`]. Later calls return `Ok`.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing queue manager");
        self.shutdown.cancel();

        let entries: Vec<(String, SessionEntry)> =
            self.sessions.write().await.drain().collect();
        let abandoned = self.join_workers(entries).await;

        if abandoned.is_empty() {
            info!("Queue manager closed");
            Ok(())
        } else {
            warn!(?abandoned, "Queue manager closed with abandoned workers");
            Err(QueueError::ShutdownTimeout { abandoned })
        }
    }

    /// Wait for stopped workers until the shutdown deadline; abort the rest.
    async fn join_workers(&self, entries: Vec<(String, SessionEntry)>) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();
        let mut abandoned = Vec::new();

        for (session_id, mut entry) in entries {
            if tokio::time::timeout_at(deadline, &mut entry.worker)
                .await
                .is_ok()
            {
                continue;
            }
            warn!(%session_id, "Worker did not stop in time, aborting");
            entry.worker.abort();

            // An aborted worker never reaches its own cleanup.
            let unfinished = entry.queue.state.lock().await.drain_unfinished();
            for message in unfinished {
                message.handle.cancel_with(QueryError::ShuttingDown);
            }
            abandoned.push(session_id);
        }
        abandoned.sort();
        abandoned
    }

    async fn session(&self, session_id: &str) -> Result<Arc<SessionQueue>, QueueError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.queue))
            .ok_or_else(|| QueueError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    async fn session_or_create(&self, session_id: &str) -> Result<Arc<SessionQueue>, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        if let Ok(queue) = self.session(session_id).await {
            return Ok(queue);
        }

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock; close may have drained the map.
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        if let Some(entry) = sessions.get(session_id) {
            return Ok(Arc::clone(&entry.queue));
        }

        let queue = Arc::new(SessionQueue::new(
            session_id.to_string(),
            self.config.history_limit,
            self.shutdown.child_token(),
        ));
        let worker = Worker::new(
            Arc::clone(&queue),
            Arc::clone(&self.factory),
            self.config.clone(),
        );
        let handle = tokio::spawn(worker.run());
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                queue: Arc::clone(&queue),
                worker: handle,
            },
        );
        info!(session_id, "Session created");
        Ok(queue)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use agentwire_core::ndjson::Message;

    use super::*;
    use crate::testing::{CRASH_PROMPT, MockControl, MockFactory, STALL_PROMPT};

    fn config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 10,
            shutdown_timeout_secs: 5,
            history_limit: 10,
            drain_timeout_secs: 5,
        }
    }

    fn manager(control: &MockControl) -> QueueManager {
        manager_with(control, config())
    }

    fn manager_with(control: &MockControl, config: QueueConfig) -> QueueManager {
        QueueManager::new(
            Arc::new(MockFactory {
                control: control.clone(),
            }),
            config,
        )
    }

    async fn wait_processing(m: &QueueManager, session_id: &str, message_id: &str) {
        for _ in 0..500 {
            let status = m.get_message(session_id, message_id).await.unwrap().status;
            if status == MessageStatus::Processing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("message {message_id} never started processing");
    }

    async fn wait_sent(control: &MockControl, prompt: &str) {
        for _ in 0..500 {
            if control.prompts().iter().any(|p| p == prompt) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("prompt {prompt} was never sent");
    }

    /// Wait for the worker to record the last outcome.
    async fn settle(m: &QueueManager, session_id: &str) {
        for _ in 0..500 {
            if m.queue_status(session_id).await.unwrap().processing.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {session_id} never went idle");
    }

    async fn assistant_texts(handle: &QueryHandle) -> Vec<String> {
        let mut rx = handle.take_messages().unwrap();
        let mut texts = Vec::new();
        while let Some(msg) = rx.recv().await {
            if let Message::Assistant(a) = msg {
                texts.push(a.text());
            }
        }
        texts
    }

    #[tokio::test]
    async fn enqueue_dispatches_and_completes() {
        let control = MockControl::open();
        let m = manager(&control);

        let h = m.enqueue("s", "hello").await.unwrap();
        assert_eq!(h.session_id(), "s");
        assert_eq!(h.wait().await, Ok(()));
        assert_eq!(h.wait().await, Ok(()));
        assert_eq!(assistant_texts(&h).await, vec!["reply to hello"]);
        settle(&m, "s").await;

        let msg = m.get_message("s", h.id()).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Completed);
        let stats = m.queue_status("s").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!(stats.processing.is_none());
        assert_eq!(m.history("s").await.unwrap().len(), 1);

        m.close().await.unwrap();
        assert_eq!(control.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paused_queue_holds_then_resumes_in_order() {
        let control = MockControl::open();
        let m = manager(&control);

        m.pause("s").await.unwrap();
        let handles = [
            m.enqueue("s", "a").await.unwrap(),
            m.enqueue("s", "b").await.unwrap(),
            m.enqueue("s", "c").await.unwrap(),
        ];
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(control.prompts().is_empty());
        let stats = m.queue_status("s").await.unwrap();
        assert!(stats.paused);
        assert_eq!(stats.pending, 3);

        m.resume("s").await.unwrap();
        for h in &handles {
            h.wait().await.unwrap();
        }
        assert_eq!(control.prompts(), vec!["a", "b", "c"]);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn reorder_before_dispatch_sets_order() {
        let control = MockControl::open();
        let m = manager(&control);

        m.pause("s").await.unwrap();
        let a = m.enqueue("s", "A").await.unwrap();
        let b = m.enqueue("s", "B").await.unwrap();
        let c = m.enqueue("s", "C").await.unwrap();
        let order = vec![c.id().to_string(), a.id().to_string(), b.id().to_string()];
        m.reorder("s", &order).await.unwrap();

        let pending: Vec<_> = m
            .list_pending("s")
            .await
            .unwrap()
            .into_iter()
            .map(|msg| msg.id)
            .collect();
        assert_eq!(pending, order);

        m.resume("s").await.unwrap();
        for h in [&a, &b, &c] {
            h.wait().await.unwrap();
        }
        assert_eq!(control.prompts(), vec!["C", "A", "B"]);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn priority_dispatches_first() {
        let control = MockControl::open();
        let m = manager(&control);

        m.pause("s").await.unwrap();
        let low = m.enqueue("s", "low").await.unwrap();
        let high = m.enqueue_with_priority("s", "high", 5).await.unwrap();
        let bumped = m.enqueue("s", "bumped").await.unwrap();
        m.set_priority("s", bumped.id(), 10).await.unwrap();
        m.resume("s").await.unwrap();

        for h in [&low, &high, &bumped] {
            h.wait().await.unwrap();
        }
        assert_eq!(control.prompts(), vec!["bumped", "high", "low"]);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_processing_message_fails() {
        let control = MockControl::gated(0);
        let m = manager(&control);

        let a = m.enqueue("s", "a").await.unwrap();
        wait_processing(&m, "s", a.id()).await;

        assert_eq!(
            m.remove_from_queue("s", a.id()).await.unwrap_err(),
            QueueError::AlreadyProcessing {
                message_id: a.id().to_string()
            }
        );
        assert_eq!(
            m.get_message("s", a.id()).await.unwrap().status,
            MessageStatus::Processing
        );

        control.gate.add_permits(1);
        assert_eq!(a.wait().await, Ok(()));
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_and_clear_cancel_pending_only() {
        let control = MockControl::gated(0);
        let m = manager(&control);

        let a = m.enqueue("s", "a").await.unwrap();
        wait_processing(&m, "s", a.id()).await;
        let b = m.enqueue("s", "b").await.unwrap();

        let removed = m.remove_from_queue("s", b.id()).await.unwrap();
        assert_eq!(removed.status, MessageStatus::Removed);
        assert_eq!(b.wait().await, Err(QueryError::Cancelled));
        assert_eq!(
            m.get_message("s", b.id()).await.unwrap().status,
            MessageStatus::Removed
        );

        let c = m.enqueue("s", "c").await.unwrap();
        let d = m.enqueue("s", "d").await.unwrap();
        assert_eq!(m.clear_queue("s").await.unwrap(), 2);
        assert_eq!(c.wait().await, Err(QueryError::Cancelled));
        assert_eq!(d.wait().await, Err(QueryError::Cancelled));
        assert_eq!(
            m.queue_status("s").await.unwrap().processing.as_deref(),
            Some(a.id())
        );

        control.gate.add_permits(1);
        assert_eq!(a.wait().await, Ok(()));
        assert_eq!(control.prompts(), vec!["a"]);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_in_flight_interrupts_and_next_turn_is_clean() {
        let control = MockControl::gated(0);
        let m = manager(&control);

        let a = m.enqueue("s", "a").await.unwrap();
        wait_sent(&control, "a").await;
        assert!(a.cancel());
        assert!(!a.cancel());
        assert_eq!(a.wait().await, Err(QueryError::Cancelled));

        let b = m.enqueue("s", "b").await.unwrap();
        control.gate.add_permits(10);
        assert_eq!(b.wait().await, Ok(()));
        assert_eq!(assistant_texts(&b).await, vec!["reply to b"]);

        assert_eq!(control.sent(), vec!["a", "interrupt", "b"]);
        assert_eq!(control.created.load(Ordering::SeqCst), 1);

        settle(&m, "s").await;
        let history = m.history("s").await.unwrap();
        assert_eq!(history[0].status, MessageStatus::Cancelled);
        assert_eq!(history[1].status, MessageStatus::Completed);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_before_line_is_queued_skips_interrupt() {
        let control = MockControl::open();
        let m = manager(&control);

        let stalled = m.enqueue("s", STALL_PROMPT).await.unwrap();
        wait_sent(&control, STALL_PROMPT).await;
        assert!(stalled.cancel());
        assert_eq!(stalled.wait().await, Err(QueryError::Cancelled));

        let next = m.enqueue("s", "b").await.unwrap();
        assert_eq!(next.wait().await, Ok(()));
        assert_eq!(control.sent(), vec![STALL_PROMPT, "b"]);
        assert_eq!(control.created.load(Ordering::SeqCst), 1);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn crashed_transport_is_replaced() {
        let control = MockControl::open();
        let m = manager(&control);

        let crashed = m.enqueue("s", CRASH_PROMPT).await.unwrap();
        let err = crashed.wait().await.unwrap_err();
        assert!(
            matches!(err, QueryError::Transport(ref text) if text.contains("mock crash")),
            "{err:?}"
        );

        let next = m.enqueue("s", "after").await.unwrap();
        assert_eq!(next.wait().await, Ok(()));
        assert_eq!(control.created.load(Ordering::SeqCst), 2);
        assert_eq!(m.queue_status("s").await.unwrap().failed, 1);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_cancels_outstanding_work() {
        let control = MockControl::gated(0);
        let m = manager(&control);

        let a = m.enqueue("s", "a").await.unwrap();
        let b = m.enqueue("s", "b").await.unwrap();
        wait_sent(&control, "a").await;

        m.close().await.unwrap();
        assert_eq!(a.wait().await, Err(QueryError::ShuttingDown));
        assert_eq!(b.wait().await, Err(QueryError::ShuttingDown));
        assert_eq!(
            m.enqueue("s", "late").await.unwrap_err(),
            QueueError::ShuttingDown
        );
        assert!(m.sessions().await.is_empty());
        m.close().await.unwrap();
        assert_eq!(control.prompts(), vec!["a"]);
    }

    #[tokio::test]
    async fn close_reports_abandoned_workers() {
        let mut control = MockControl::open();
        control.close_delay = Duration::from_secs(5);
        let m = manager_with(
            &control,
            QueueConfig {
                shutdown_timeout_secs: 1,
                ..config()
            },
        );

        m.enqueue("slow", "a").await.unwrap().wait().await.unwrap();
        m.pause("slow").await.unwrap();
        let pending = m.enqueue("slow", "never").await.unwrap();

        assert_eq!(
            m.close().await.unwrap_err(),
            QueueError::ShutdownTimeout {
                abandoned: vec!["slow".to_string()]
            }
        );
        assert_eq!(pending.wait().await, Err(QueryError::ShuttingDown));
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let control = MockControl::open();
        let m = manager(&control);

        m.enqueue("s2", "x").await.unwrap().wait().await.unwrap();
        m.enqueue("s1", "y").await.unwrap().wait().await.unwrap();
        assert_eq!(m.sessions().await, vec!["s1", "s2"]);

        m.remove_session("s1").await.unwrap();
        assert_eq!(m.sessions().await, vec!["s2"]);
        assert_eq!(
            m.remove_session("s1").await.unwrap_err(),
            QueueError::SessionNotFound {
                session_id: "s1".to_string()
            }
        );
        assert_eq!(control.created.load(Ordering::SeqCst), 2);
        m.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_and_message() {
        let m = manager(&MockControl::open());
        assert!(matches!(
            m.resume("nope").await,
            Err(QueueError::SessionNotFound { .. })
        ));
        assert!(matches!(
            m.queue_status("nope").await,
            Err(QueueError::SessionNotFound { .. })
        ));

        m.pause("s").await.unwrap();
        assert!(matches!(
            m.get_message("s", "missing").await,
            Err(QueueError::MessageNotFound { .. })
        ));
        assert!(matches!(
            m.reorder("s", &["missing".to_string()]).await,
            Err(QueueError::InvalidReorder { .. })
        ));
        m.close().await.unwrap();
    }
}
