//! Managed Process - direct process spawning with stdio capture
//!
//! The supervisor owns at most one of these at a time. It provides:
//! - stdin command injection through a channel-fed writer task
//! - stdout/stderr capture into a shared ring buffer, optionally echoed to our console
//! - a single exit notification carrying the exit code
//! - forced termination on request

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::error::SupervisorError;

/// Default maximum number of console lines kept in memory.
/// Overridable through `server.log_buffer_size`.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

// ─── Console Types ───────────────────────────────────────────

/// A single line of console output from the managed process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID starting at 1, for polling (`GET /api/server/console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    pub source: LogSource,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lifecycle messages from the keeper itself
    System,
}

/// Ring buffer of recent console lines. Shared across process generations,
/// so ids keep increasing over restarts.
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_BUFFER)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 1,
            max_size,
        }
    }

    pub fn push(&mut self, source: LogSource, content: String) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            id,
            timestamp: Utc::now().timestamp(),
            source,
            content,
        });
        id
    }

    /// Lines with id > `since_id`.
    pub fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedLog = Arc<Mutex<LogBuffer>>;

// ─── Launch ──────────────────────────────────────────────────

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub server_dir: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// A bare name (`java`) is left to PATH lookup; anything with a separator
    /// is taken relative to the server directory and made absolute, since the
    /// child's working directory differs from ours.
    pub fn program(&self) -> PathBuf {
        let exe = Path::new(&self.executable);
        if exe.is_absolute() || exe.components().count() == 1 && !self.executable.contains('/') {
            return exe.to_path_buf();
        }
        let joined = self.server_dir.join(exe);
        if joined.is_absolute() {
            joined
        } else {
            std::env::current_dir().map(|cwd| cwd.join(&joined)).unwrap_or(joined)
        }
    }
}

/// How the process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

// ─── Managed Process ─────────────────────────────────────────

pub struct ManagedProcess {
    stdin_tx: mpsc::Sender<String>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    pub pid: u32,
}

impl ManagedProcess {
    /// Spawn the server. When `echo` is set every captured line is also
    /// written to our own stdout/stderr.
    pub async fn spawn(launch: &LaunchSpec, log: SharedLog, echo: bool) -> Result<Self, SupervisorError> {
        let program = launch.program();
        let mut cmd = crate::utils::captured_command(&program, std::process::Stdio::piped());
        cmd.args(&launch.args).current_dir(&launch.server_dir).kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            program: program.display().to_string(),
            source: e,
        })?;

        let pid = child.id().unwrap_or(0);

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(256);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let buf = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut console = tokio::io::stdout();
                while let Ok(Some(line)) = lines.next_line().await {
                    if echo {
                        let _ = console.write_all(format!("{}\n", line).as_bytes()).await;
                    }
                    buf.lock().await.push(LogSource::Stdout, line);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = child.stderr.take() {
            let buf = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut console = tokio::io::stderr();
                while let Ok(Some(line)) = lines.next_line().await {
                    if echo {
                        let _ = console.write_all(format!("{}\n", line).as_bytes()).await;
                    }
                    buf.lock().await.push(LogSource::Stderr, line);
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin) = child.stdin.take() {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some(cmd) = rx.recv().await {
                    let data = format!("{}\n", cmd);
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let buf = log.clone();
            let kill = kill.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Failed to kill server process {}: {}", pid, e);
                        }
                        child.wait().await
                    }
                };
                let (msg, code) = match status {
                    Ok(status) => (format!("Process exited with {}", status), status.code()),
                    Err(e) => (format!("Failed to wait for process: {}", e), None),
                };
                tracing::debug!("{}", msg);
                buf.lock().await.push(LogSource::System, msg);
                let _ = exit_tx.send(Some(ProcessExit { code }));
            });
        }

        log.lock()
            .await
            .push(LogSource::System, format!("Process started with PID {}", pid));

        Ok(Self {
            stdin_tx,
            kill,
            exit_rx,
            pid,
        })
    }

    /// Queue `command` for stdin; the writer appends the newline.
    pub async fn send_command(&self, command: &str) -> Result<(), SupervisorError> {
        self.stdin_tx
            .send(command.to_string())
            .await
            .map_err(|_| SupervisorError::StdinClosed)
    }

    /// Request forced termination. The exit is still reported through the
    /// exit channel.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }
}

/// Resolve once the process behind `rx` has exited.
pub async fn wait_for_exit(mut rx: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    loop {
        if let Some(exit) = *rx.borrow_and_update() {
            return Some(exit);
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────
