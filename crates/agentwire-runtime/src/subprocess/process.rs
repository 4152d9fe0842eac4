//! Agent CLI subprocess lifecycle.
//!
//! [`AgentProcess`] is the single owner of one OS process and its three
//! standard streams. It moves through an explicit state machine
//! (`NotStarted -> Running -> Terminating -> Stopped`) and shuts down with a
//! fixed protocol: close stdin, SIGTERM, wait up to [`GRACE_PERIOD`], SIGKILL,
//! then always reap.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentwire_core::CommandSpec;

/// Time between the graceful signal and the forced kill.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 32;

/// Longer stderr lines are truncated; the rest is still drained.
const STDERR_LINE_MAX: usize = 8 * 1024;

/// How long to wait for the stderr drain after the process is reaped.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of an [`AgentProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Terminating,
    Stopped,
}

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Working directory does not exist: {}", path.display())]
    WorkingDirectory { path: PathBuf },

    #[error("Failed to spawn {}: {source}", program.display())]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {stream} of agent process")]
    MissingPipe { stream: &'static str },

    #[error("Agent process already started")]
    AlreadyStarted,

    #[error("Agent process is not running")]
    NotRunning,

    #[error("Agent process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One agent CLI process.
pub struct AgentProcess {
    state: watch::Sender<ProcessState>,
    pid: OnceLock<u32>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AgentProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentProcess {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ProcessState::NotStarted),
            pid: OnceLock::new(),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            stderr_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Spawn the process described by `spec`.
    ///
    /// Start failures are final; there is no retry at this level.
    pub async fn start(&self, spec: &CommandSpec) -> Result<(), ProcessError> {
        let mut child_slot = self.child.lock().await;
        if self.state() != ProcessState::NotStarted {
            return Err(ProcessError::AlreadyStarted);
        }

        if let Some(ref cwd) = spec.cwd
            && !cwd.is_dir()
        {
            return Err(ProcessError::WorkingDirectory { path: cwd.clone() });
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }

        info!(
            program = %spec.program.display(),
            cwd = ?spec.cwd,
            args = spec.args.len(),
            "Spawning agent subprocess"
        );
        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stderr" })?;

        if let Some(pid) = child.id() {
            self.pid.set(pid).ok();
        }

        // Stderr must always be drained, or a chatty process blocks on a
        // full pipe while nothing reads it.
        let task = tokio::spawn(read_stderr(
            stderr,
            Arc::clone(&self.stderr_tail),
            self.pid(),
        ));

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(stdout);
        *self.stderr_task.lock().await = Some(task);
        *child_slot = Some(child);
        self.state.send_replace(ProcessState::Running);

        info!(pid = ?self.pid(), "Agent subprocess started");
        Ok(())
    }

    /// Hand the stdout pipe to the reader. Yields it once.
    pub async fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().await.take()
    }

    /// Write `line` plus a newline to stdin as one uninterrupted unit.
    pub async fn write_line(&self, line: &[u8]) -> Result<(), ProcessError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::NotRunning)?;
        stdin.write_all(line).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Exit status if the process has already exited.
    pub async fn try_exit_status(&self) -> Option<ExitStatus> {
        let mut guard = self.child.lock().await;
        guard.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    /// Most recent stderr lines, oldest first.
    pub async fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().await.iter().cloned().collect()
    }

    /// Wait up to `timeout` for the stderr reader to hit EOF, so the tail
    /// holds everything the process wrote before exiting.
    pub async fn finish_stderr(&self, timeout: Duration) {
        let task = self.stderr_task.lock().await.take();
        if let Some(mut task) = task
            && tokio::time::timeout(timeout, &mut task).await.is_err()
        {
            task.abort();
        }
    }

    /// Stop the process: close stdin, SIGTERM, wait [`GRACE_PERIOD`],
    /// SIGKILL, reap.
    ///
    /// Returns once the OS has reaped the process. Calling it on a process
    /// that never started or already stopped is a no-op.
    pub async fn terminate(&self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.lock().await.take() else {
            if self.state() == ProcessState::NotStarted {
                self.state.send_replace(ProcessState::Stopped);
            }
            return Ok(());
        };
        self.state.send_replace(ProcessState::Terminating);
        let started = Instant::now();
        let pid = self.pid();

        // Closing stdin lets a well-behaved CLI finish on its own. A writer
        // blocked on a full pipe holds the lock; the signal and kill below
        // break that pipe, so never wait for it here.
        self.close_stdin();

        if child.try_wait()?.is_none() {
            send_graceful_signal(&child);

            match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(?pid, ?status, "Agent process exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(?pid, error = %e, "Error waiting for agent process, killing");
                    kill(&mut child, pid).await;
                }
                Err(_) => {
                    warn!(?pid, "Grace period elapsed, killing agent process");
                    kill(&mut child, pid).await;
                }
            }
        }

        // Reap. Returns the cached status if already collected.
        let status = child.wait().await;
        debug!(?pid, ?status, elapsed_ms = started.elapsed().as_millis(), "Agent process reaped");

        self.close_stdin();
        self.finish_stderr(STDERR_DRAIN_TIMEOUT).await;
        self.state.send_replace(ProcessState::Stopped);
        status.map(|_| ()).map_err(ProcessError::Io)
    }

    fn close_stdin(&self) {
        if let Ok(mut stdin) = self.stdin.try_lock() {
            drop(stdin.take());
        }
    }
}

async fn kill(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        warn!(?pid, error = %e, "Failed to kill agent process");
    }
}

#[cfg(unix)]
fn send_graceful_signal(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: pid comes from our own un-reaped Child handle, so it cannot
    // have been recycled for another process. kill(2) with SIGTERM has no
    // memory-safety preconditions.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, error = %err, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_child: &Child) {
    // No graceful signal; the closed stdin is the only hint before the kill.
}

async fn read_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        let chunk = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(?pid, error = %e, "Failed to read agent stderr");
                break;
            }
        };
        let newline = chunk.iter().position(|b| *b == b'\n');
        let end = newline.map_or(chunk.len(), |i| i + 1);
        let room = STDERR_LINE_MAX.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..end.min(room)]);
        reader.consume(end);

        if newline.is_some() {
            push_stderr_line(&tail, &line, pid).await;
            line.clear();
        }
    }
    if !line.is_empty() {
        push_stderr_line(&tail, &line, pid).await;
    }
    debug!(?pid, "stderr reader finished");
}

async fn push_stderr_line(tail: &Mutex<VecDeque<String>>, raw: &[u8], pid: Option<u32>) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches(['\n', '\r']);
    debug!(?pid, "stderr: {}", text);
    let mut tail = tail.lock().await;
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(text.to_string());
}
