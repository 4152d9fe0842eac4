//! In-memory transport for queue tests.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use agentwire_core::ndjson::{Message, StreamMessage, parse_line};

use crate::transport::{MessageStream, Transport, TransportError, TransportFactory};

/// Prompt that makes the mock report an unexpected process exit.
pub(crate) const CRASH_PROMPT: &str = "crash";

/// Prompt whose send never gets queued; it waits for cancellation.
pub(crate) const STALL_PROMPT: &str = "stall";

fn assistant(session_id: &str, text: &str) -> Message {
    let line = serde_json::json!({
        "type": "assistant",
        "session_id": session_id,
        "message": {"model": "mock", "content": [{"type": "text", "text": text}]},
    });
    parse_line(&line.to_string()).unwrap_or_else(|e| panic!("mock assistant: {e}"))
}

fn result(session_id: &str, subtype: &str) -> Message {
    let line = serde_json::json!({
        "type": "result",
        "subtype": subtype,
        "is_error": subtype != "success",
        "duration_ms": 1,
        "num_turns": 1,
        "session_id": session_id,
    });
    parse_line(&line.to_string()).unwrap_or_else(|e| panic!("mock result: {e}"))
}

/// Shared knobs and observations across every transport a factory makes.
#[derive(Clone)]
pub(crate) struct MockControl {
    /// One permit releases one reply.
    pub gate: Arc<Semaphore>,
    /// Sent prompts and `interrupt` markers, in order.
    pub sent: Arc<Mutex<Vec<String>>>,
    pub created: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub close_delay: Duration,
}

impl MockControl {
    pub fn open() -> Self {
        Self::gated(Semaphore::MAX_PERMITS)
    }

    pub fn gated(permits: usize) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(permits)),
            sent: Arc::new(Mutex::new(Vec::new())),
            created: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            close_delay: Duration::ZERO,
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Prompts only, without interrupt markers.
    pub fn prompts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s != "interrupt")
            .collect()
    }
}

pub(crate) struct MockTransport {
    session_id: String,
    control: MockControl,
    messages: Mutex<Option<mpsc::Sender<Message>>>,
    errors: Mutex<Option<mpsc::Sender<TransportError>>>,
    stream: Mutex<Option<MessageStream>>,
    replies: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl MockTransport {
    fn new(session_id: &str, control: MockControl) -> Self {
        Self {
            session_id: session_id.to_string(),
            control,
            messages: Mutex::new(None),
            errors: Mutex::new(None),
            stream: Mutex::new(None),
            replies: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Message>, TransportError> {
        self.messages
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().cloned())
            .ok_or(TransportError::Closed)
    }

    fn log(&self, entry: &str) {
        if let Ok(mut sent) = self.control.sent.lock() {
            sent.push(entry.to_string());
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(64);
        *self.messages.lock().map_err(|_| TransportError::Closed)? = Some(msg_tx);
        *self.errors.lock().map_err(|_| TransportError::Closed)? = Some(err_tx);
        *self.stream.lock().map_err(|_| TransportError::Closed)? = Some(MessageStream {
            messages: msg_rx,
            errors: err_rx,
        });
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(
        &self,
        message: &StreamMessage,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let prompt = message
            .message
            .as_ref()
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        self.log(&prompt);

        if prompt == STALL_PROMPT {
            cancel.cancelled().await;
            return Err(TransportError::Cancelled);
        }
        if prompt == CRASH_PROMPT {
            self.connected.store(false, Ordering::SeqCst);
            let errors = self.errors.lock().ok().and_then(|mut e| e.take());
            if let Some(errors) = errors {
                let _ = errors
                    .send(TransportError::ProcessExited {
                        code: Some(1),
                        stderr: "mock crash".to_string(),
                    })
                    .await;
            }
            drop(self.messages.lock().ok().and_then(|mut m| m.take()));
            return Ok(());
        }

        let tx = self.sender()?;
        let gate = Arc::clone(&self.control.gate);
        let session_id = self.session_id.clone();
        let reply = tokio::spawn(async move {
            let Ok(permit) = gate.acquire().await else {
                return;
            };
            permit.forget();
            let _ = tx.send(assistant(&session_id, &format!("reply to {prompt}"))).await;
            let _ = tx.send(result(&session_id, "success")).await;
        });
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(reply);
        }
        Ok(())
    }

    async fn receive(&self, _cancel: &CancellationToken) -> Result<MessageStream, TransportError> {
        self.stream
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .ok_or(TransportError::StreamTaken)
    }

    async fn interrupt(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        self.log("interrupt");
        // The interrupted turn ends with one error result and nothing else.
        let pending: Vec<_> = self
            .replies
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default();
        for reply in pending {
            reply.abort();
        }
        let tx = self.sender()?;
        tx.send(result(&self.session_id, "error_during_execution"))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.control.close_delay.is_zero() {
            tokio::time::sleep(self.control.close_delay).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        drop(self.messages.lock().ok().and_then(|mut m| m.take()));
        drop(self.errors.lock().ok().and_then(|mut e| e.take()));
        let pending: Vec<_> = self
            .replies
            .lock()
            .map(|mut r| r.drain(..).collect())
            .unwrap_or_default();
        for reply in pending {
            reply.abort();
        }
        self.control.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockFactory {
    pub control: MockControl,
}

impl TransportFactory for MockFactory {
    fn create(&self, session_id: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.control.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport::new(session_id, self.control.clone())))
    }
}
