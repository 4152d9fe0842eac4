//! Transport over an agent CLI subprocess.
//!
//! Data flow:
//! ```text
//! send() -> writer task -> process stdin
//! process stdout -> read loop -> StreamDecoder -> MessageStream
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentwire_core::config::TransportConfig;
use agentwire_core::ndjson::{Message, StreamDecoder, StreamMessage};
use agentwire_core::{AgentOptions, CommandSpec, build_command, resolve_cli_path};

use super::{MessageStream, Transport, TransportError, TransportFactory};
use crate::subprocess::AgentProcess;

/// Bytes requested per stdout read.
const READ_CHUNK: usize = 64 * 1024;

/// How long the read loop waits for an exit status after stdout EOF.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(500);
const EXIT_STATUS_POLL: Duration = Duration::from_millis(25);
const STDERR_WAIT: Duration = Duration::from_millis(500);

/// How long `close` waits for the read loop after the process is reaped.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A line queued for the writer task, acknowledged once written.
struct WriteRequest {
    line: Vec<u8>,
    ack: oneshot::Sender<Result<(), String>>,
}

struct Connection {
    process: Arc<AgentProcess>,
    writer_tx: mpsc::Sender<WriteRequest>,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    stream: Option<MessageStream>,
}

enum Link {
    Idle,
    Connected(Connection),
    Closed,
}

/// [`Transport`] backed by one agent CLI process.
pub struct SubprocessTransport {
    session_id: String,
    spec: CommandSpec,
    config: TransportConfig,
    link: Mutex<Link>,
    alive: Arc<AtomicBool>,
    request_counter: AtomicU64,
}

impl SubprocessTransport {
    pub fn new(session_id: impl Into<String>, spec: CommandSpec, config: TransportConfig) -> Self {
        Self {
            session_id: session_id.into(),
            spec,
            config,
            link: Mutex::new(Link::Idle),
            alive: Arc::new(AtomicBool::new(false)),
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// OS process id, once connected.
    pub async fn pid(&self) -> Option<u32> {
        match &*self.link.lock().await {
            Link::Connected(conn) => conn.process.pid(),
            Link::Idle | Link::Closed => None,
        }
    }

    async fn writer_tx(&self) -> Result<mpsc::Sender<WriteRequest>, TransportError> {
        match &*self.link.lock().await {
            Link::Connected(conn) => Ok(conn.writer_tx.clone()),
            Link::Idle => Err(TransportError::NotConnected),
            Link::Closed => Err(TransportError::Closed),
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("req_{n}_{}", &suffix[..8])
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        match *link {
            Link::Idle => {}
            Link::Connected(_) => return Err(TransportError::AlreadyConnected),
            Link::Closed => return Err(TransportError::Closed),
        }
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let process = Arc::new(AgentProcess::new());
        process.start(&self.spec).await?;
        let Some(stdout) = process.take_stdout().await else {
            process.terminate().await?;
            return Err(TransportError::NotConnected);
        };

        let capacity = self.config.channel_capacity.max(1);
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (err_tx, err_rx) = mpsc::channel(capacity);
        let (writer_tx, writer_rx) = mpsc::channel::<WriteRequest>(capacity);
        let shutdown = CancellationToken::new();

        self.alive.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_loop(ReadLoop {
            session_id: self.session_id.clone(),
            stdout,
            decoder: StreamDecoder::with_max_size(self.config.max_buffer_size),
            messages: msg_tx,
            errors: err_tx,
            process: Arc::clone(&process),
            shutdown: shutdown.clone(),
            alive: Arc::clone(&self.alive),
        }));
        let writer = tokio::spawn(write_loop(
            self.session_id.clone(),
            writer_rx,
            Arc::clone(&process),
        ));

        info!(session_id = %self.session_id, pid = ?process.pid(), "Transport connected");
        *link = Link::Connected(Connection {
            process,
            writer_tx,
            shutdown,
            reader,
            writer,
            stream: Some(MessageStream {
                messages: msg_rx,
                errors: err_rx,
            }),
        });
        Ok(())
    }

    async fn send(
        &self,
        message: &StreamMessage,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let line = message.to_line()?.into_bytes();
        let writer_tx = self.writer_tx().await?;
        let (ack_tx, ack_rx) = oneshot::channel();

        // `Cancelled` means nothing reached the writer.
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            sent = writer_tx.send(WriteRequest { line, ack: ack_tx }) => {
                sent.map_err(|_| TransportError::Closed)?;
            }
        }

        // Once queued the line is written whole even if the caller stops
        // waiting for the acknowledgement.
        tokio::select! {
            ack = ack_rx => match ack {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::WriteFailed(e)),
                Err(_) => Err(TransportError::Closed),
            },
            () = cancel.cancelled() => Err(TransportError::CancelledInFlight),
        }
    }

    async fn receive(&self, cancel: &CancellationToken) -> Result<MessageStream, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        match &mut *self.link.lock().await {
            Link::Connected(conn) => conn.stream.take().ok_or(TransportError::StreamTaken),
            Link::Idle => Err(TransportError::NotConnected),
            Link::Closed => Err(TransportError::Closed),
        }
    }

    async fn interrupt(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let request_id = self.next_request_id();
        debug!(session_id = %self.session_id, %request_id, "Sending interrupt");
        let request =
            StreamMessage::control_request(request_id, serde_json::json!({ "subtype": "interrupt" }));
        self.send(&request, cancel).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let previous = std::mem::replace(&mut *self.link.lock().await, Link::Closed);
        let Link::Connected(conn) = previous else {
            return Ok(());
        };

        let Connection {
            process,
            writer_tx,
            shutdown,
            mut reader,
            writer,
            stream,
        } = conn;

        info!(session_id = %self.session_id, pid = ?process.pid(), "Closing transport");
        shutdown.cancel();
        drop(writer_tx);
        drop(stream);
        // A write stuck on a full stdin pipe must not delay the signal.
        writer.abort();

        let result = process.terminate().await;
        self.alive.store(false, Ordering::SeqCst);

        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!(session_id = %self.session_id, "Read loop did not stop, aborting");
            reader.abort();
        }

        result.map_err(TransportError::from)
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

async fn write_loop(
    session_id: String,
    mut requests: mpsc::Receiver<WriteRequest>,
    process: Arc<AgentProcess>,
) {
    while let Some(WriteRequest { line, ack }) = requests.recv().await {
        let result = process
            .write_line(&line)
            .await
            .map_err(|e| e.to_string());
        if let Err(ref e) = result {
            warn!(%session_id, error = %e, "Write to agent stdin failed");
        }
        // The sender may have given up waiting; the line was written anyway.
        let _ = ack.send(result);
    }
    debug!(%session_id, "Writer task finished");
}

struct ReadLoop {
    session_id: String,
    stdout: ChildStdout,
    decoder: StreamDecoder,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<TransportError>,
    process: Arc<AgentProcess>,
    shutdown: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl ReadLoop {
    /// Deliver `item` unless shutdown wins first. A dropped receiver is not
    /// a reason to stop reading; the process must not block on a full pipe.
    async fn forward<T: Send>(&self, tx: &mpsc::Sender<T>, item: T) -> bool {
        tokio::select! {
            _ = tx.send(item) => true,
            () = self.shutdown.cancelled() => false,
        }
    }

    async fn dispatch(&mut self, chunk: &[u8]) -> bool {
        for item in self.decoder.feed(chunk) {
            let delivered = match item {
                Ok(message) => self.forward(&self.messages, message).await,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "Failed to decode agent output");
                    self.forward(&self.errors, TransportError::Decode(e)).await
                }
            };
            if !delivered {
                return false;
            }
        }
        true
    }

    async fn report_exit(&mut self) {
        if let Some(e) = self.decoder.finish() {
            self.forward(&self.errors, TransportError::Decode(e)).await;
        }

        let mut status = None;
        let deadline = tokio::time::Instant::now() + EXIT_STATUS_WAIT;
        while tokio::time::Instant::now() < deadline {
            status = self.process.try_exit_status().await;
            if status.is_some() || self.shutdown.is_cancelled() {
                break;
            }
            tokio::time::sleep(EXIT_STATUS_POLL).await;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        let code = status.and_then(|s| s.code());
        self.process.finish_stderr(STDERR_WAIT).await;
        let stderr = self.process.stderr_tail().await.join("\n");
        warn!(session_id = %self.session_id, ?code, "Agent process exited unexpectedly");
        self.forward(&self.errors, TransportError::ProcessExited { code, stderr })
            .await;
    }
}

async fn read_loop(mut ctx: ReadLoop) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            read = ctx.stdout.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                if !ctx.shutdown.is_cancelled() {
                    ctx.report_exit().await;
                }
                break;
            }
            Ok(n) => {
                if !ctx.dispatch(&buf[..n]).await {
                    break;
                }
            }
            Err(e) => {
                if !ctx.shutdown.is_cancelled() {
                    warn!(session_id = %ctx.session_id, error = %e, "Failed to read agent stdout");
                    ctx.forward(&ctx.errors, TransportError::Process(e.into()))
                        .await;
                }
                break;
            }
        }
    }
    ctx.alive.store(false, Ordering::SeqCst);
    debug!(session_id = %ctx.session_id, "Read loop finished");
}

/// Builds a [`SubprocessTransport`] per session from shared options.
pub struct SubprocessTransportFactory {
    options: AgentOptions,
    config: TransportConfig,
}

impl SubprocessTransportFactory {
    pub const fn new(options: AgentOptions, config: TransportConfig) -> Self {
        Self { options, config }
    }
}

impl TransportFactory for SubprocessTransportFactory {
    fn create(&self, session_id: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let cli_path = resolve_cli_path(&self.options, self.config.cli_path.as_deref())?;
        let spec = build_command(&self.options, &cli_path);
        Ok(Arc::new(SubprocessTransport::new(
            session_id,
            spec,
            self.config.clone(),
        )))
    }
}
