//! Per-session queue state.
//!
//! [`QueueState`] is plain data mutated under the [`SessionQueue`] lock;
//! nothing in it awaits, so no operation can block on the worker.

use std::collections::{HashSet, VecDeque};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::types::{MessageStatus, QueueError, QueueStats, QueuedMessage};

#[derive(Debug)]
pub(crate) struct QueueState {
    pending: Vec<QueuedMessage>,
    processing: Option<QueuedMessage>,
    history: VecDeque<QueuedMessage>,
    history_limit: usize,
    paused: bool,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl QueueState {
    pub(crate) fn new(history_limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            processing: None,
            history: VecDeque::new(),
            history_limit,
            paused: false,
            completed: 0,
            failed: 0,
            cancelled: 0,
        }
    }

    /// Insert behind every pending message of equal or higher priority.
    pub(crate) fn enqueue(&mut self, message: QueuedMessage) {
        let pos = self
            .pending
            .iter()
            .position(|m| m.priority < message.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, message);
    }

    pub(crate) fn remove(&mut self, message_id: &str) -> Result<QueuedMessage, QueueError> {
        self.ensure_not_processing(message_id)?;
        let pos = self.position(message_id)?;
        let mut message = self.pending.remove(pos);
        message.status = MessageStatus::Removed;
        self.record(message.clone());
        Ok(message)
    }

    /// Remove every pending message. The in-flight one is untouched.
    pub(crate) fn clear(&mut self) -> Vec<QueuedMessage> {
        let removed: Vec<_> = self
            .pending
            .drain(..)
            .map(|mut m| {
                m.status = MessageStatus::Removed;
                m
            })
            .collect();
        for message in &removed {
            self.record(message.clone());
        }
        removed
    }

    /// Put the pending messages in exactly the order of `order`, which
    /// must be a permutation of the pending IDs.
    pub(crate) fn reorder(&mut self, order: &[String]) -> Result<(), QueueError> {
        if let Some(processing) = self.processing.as_ref()
            && order.contains(&processing.id)
        {
            return Err(QueueError::AlreadyProcessing {
                message_id: processing.id.clone(),
            });
        }
        if order.len() != self.pending.len() {
            return Err(QueueError::InvalidReorder {
                reason: format!(
                    "expected {} message IDs, got {}",
                    self.pending.len(),
                    order.len()
                ),
            });
        }
        let unique: HashSet<&str> = order.iter().map(String::as_str).collect();
        if unique.len() != order.len() {
            return Err(QueueError::InvalidReorder {
                reason: "duplicate message ID".to_string(),
            });
        }

        if let Some(unknown) = order
            .iter()
            .find(|id| !self.pending.iter().any(|m| &m.id == *id))
        {
            return Err(QueueError::InvalidReorder {
                reason: format!("unknown message ID {unknown}"),
            });
        }

        let mut remaining = std::mem::take(&mut self.pending);
        let mut reordered = Vec::with_capacity(remaining.len());
        for id in order {
            if let Some(pos) = remaining.iter().position(|m| &m.id == id) {
                reordered.push(remaining.remove(pos));
            }
        }
        self.pending = reordered;
        Ok(())
    }

    /// Change a pending message's priority and re-sort. The sort is stable,
    /// so messages of equal priority keep their relative order.
    pub(crate) fn set_priority(&mut self, message_id: &str, priority: i32) -> Result<(), QueueError> {
        self.ensure_not_processing(message_id)?;
        let pos = self.position(message_id)?;
        self.pending[pos].priority = priority;
        self.pending.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    pub(crate) const fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub(crate) const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Pop the next dispatchable message and mark it processing.
    ///
    /// Messages whose handles were cancelled while queued are moved to
    /// history on the way.
    pub(crate) fn next_dispatch(&mut self) -> Option<QueuedMessage> {
        if self.is_paused() || self.processing.is_some() {
            return None;
        }
        while !self.pending.is_empty() {
            let mut message = self.pending.remove(0);
            if message.handle.is_done() {
                debug!(message_id = %message.id, "Skipping message cancelled while queued");
                message.status = message.handle.status().into();
                message.error = message.handle.failure();
                self.count(message.status);
                self.record(message);
                continue;
            }
            message.status = MessageStatus::Processing;
            self.processing = Some(message.clone());
            return Some(message);
        }
        None
    }

    /// Clear the processing slot, recording the handle's outcome.
    pub(crate) fn finish_processing(&mut self) -> Option<QueuedMessage> {
        let mut message = self.processing.take()?;
        message.status = message.handle.status().into();
        message.error = message.handle.failure();
        self.count(message.status);
        self.record(message.clone());
        Some(message)
    }

    /// Take everything that has not finished, for shutdown.
    pub(crate) fn drain_unfinished(&mut self) -> Vec<QueuedMessage> {
        let mut unfinished: Vec<_> = self.pending.drain(..).collect();
        if let Some(processing) = self.processing.take() {
            unfinished.insert(0, processing);
        }
        unfinished
    }

    pub(crate) fn get(&self, message_id: &str) -> Option<QueuedMessage> {
        self.processing
            .iter()
            .chain(self.pending.iter())
            .chain(self.history.iter().rev())
            .find(|m| m.id == message_id)
            .map(|m| {
                let mut snapshot = m.clone();
                if !snapshot.status.is_terminal() && snapshot.handle.is_done() {
                    snapshot.status = snapshot.handle.status().into();
                    snapshot.error = snapshot.handle.failure();
                }
                snapshot
            })
    }

    pub(crate) fn pending(&self) -> Vec<QueuedMessage> {
        self.pending.clone()
    }

    pub(crate) fn history(&self) -> Vec<QueuedMessage> {
        self.history.iter().cloned().collect()
    }

    pub(crate) fn stats(&self, session_id: &str) -> QueueStats {
        QueueStats {
            session_id: session_id.to_string(),
            pending: self.pending.len(),
            processing: self.processing.as_ref().map(|m| m.id.clone()),
            paused: self.paused,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
        }
    }

    fn ensure_not_processing(&self, message_id: &str) -> Result<(), QueueError> {
        match self.processing {
            Some(ref m) if m.id == message_id => Err(QueueError::AlreadyProcessing {
                message_id: message_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn position(&self, message_id: &str) -> Result<usize, QueueError> {
        self.pending
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| QueueError::MessageNotFound {
                message_id: message_id.to_string(),
            })
    }

    const fn count(&mut self, status: MessageStatus) {
        match status {
            MessageStatus::Completed => self.completed += 1,
            MessageStatus::Failed => self.failed += 1,
            MessageStatus::Cancelled => self.cancelled += 1,
            MessageStatus::Queued | MessageStatus::Processing | MessageStatus::Removed => {}
        }
    }

    fn record(&mut self, message: QueuedMessage) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }
}

/// One session's queue, shared between the manager and its worker.
pub(crate) struct SessionQueue {
    pub(crate) session_id: String,
    pub(crate) state: Mutex<QueueState>,
    /// Wakes the worker after enqueue and resume.
    pub(crate) notify: Notify,
    /// Stops this session's worker; child of the manager's token.
    pub(crate) shutdown: CancellationToken,
}

impl SessionQueue {
    pub(crate) fn new(session_id: String, history_limit: usize, shutdown: CancellationToken) -> Self {
        Self {
            session_id,
            state: Mutex::new(QueueState::new(history_limit)),
            notify: Notify::new(),
            shutdown,
        }
    }
}
