pub mod error;
pub mod managed_process;
pub mod state_machine;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

pub use error::SupervisorError;
use managed_process::{wait_for_exit, LaunchSpec, LogBuffer, LogLine, ManagedProcess, ProcessExit, SharedLog};
use state_machine::{ServerState, StateMachine};

use crate::config::KeeperConfig;

/// The line sent to the server's stdin to ask it to shut down.
pub const STOP_COMMAND: &str = "stop";

/// Timers used while waiting for a stopped server to go away.
#[derive(Debug, Clone, Copy)]
pub struct StopTimings {
    /// How often restart checks whether the process has exited.
    pub poll_interval: Duration,
    /// How long a graceful stop may take before the process is killed.
    pub failsafe_timeout: Duration,
}

impl Default for StopTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            failsafe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub installed: bool,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
}

struct Slot {
    machine: StateMachine,
    process: Option<Arc<ManagedProcess>>,
    /// Bumped on every successful start so a late exit observer can tell
    /// whether the process it watches is still the current one.
    generation: u64,
    last_exit_code: Option<i32>,
}

struct Inner {
    launch: LaunchSpec,
    show_console: bool,
    timings: StopTimings,
    slot: Mutex<Slot>,
    console: SharedLog,
    restarting: AtomicBool,
}

/// Owns the single managed server process.
///
/// Cloning is cheap; every clone drives the same process slot. The slot lock
/// is held across the running check and the spawn, so at most one process
/// exists at any time.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(launch: LaunchSpec, show_console: bool, timings: StopTimings, log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                launch,
                show_console,
                timings,
                slot: Mutex::new(Slot {
                    machine: StateMachine::new(),
                    process: None,
                    generation: 0,
                    last_exit_code: None,
                }),
                console: Arc::new(Mutex::new(LogBuffer::with_capacity(log_capacity))),
                restarting: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(cfg: &KeeperConfig) -> Self {
        let launch = LaunchSpec {
            server_dir: cfg.data_paths().server_dir,
            executable: cfg.server.executable.clone(),
            args: cfg.server.args.clone(),
        };
        let timings = StopTimings {
            poll_interval: Duration::from_secs(cfg.server.stop_poll_secs.max(1)),
            failsafe_timeout: Duration::from_secs(cfg.server.stop_timeout_secs),
        };
        Self::new(launch, cfg.show_console, timings, cfg.server.log_buffer_size)
    }

    pub fn server_dir(&self) -> &Path {
        &self.inner.launch.server_dir
    }

    /// Installed means the server directory exists.
    pub fn is_installed(&self) -> bool {
        self.inner.launch.server_dir.is_dir()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.slot.lock().await.process.is_some()
    }

    pub async fn last_exit_code(&self) -> Option<i32> {
        self.inner.slot.lock().await.last_exit_code
    }

    pub async fn status(&self) -> ServerStatus {
        let slot = self.inner.slot.lock().await;
        ServerStatus {
            state: slot.machine.state(),
            installed: self.is_installed(),
            pid: slot.process.as_ref().map(|p| p.pid),
            last_exit_code: slot.last_exit_code,
        }
    }

    /// Spawn the server. Returns once the spawn succeeded; readiness is not awaited.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if !self.is_installed() {
            tracing::warn!("Attempted to start server, but server is not installed.");
            return Err(SupervisorError::NotInstalled);
        }

        let mut slot = self.inner.slot.lock().await;
        if slot.process.is_some() {
            tracing::warn!("Attempted to start server, but server is already running.");
            return Err(SupervisorError::AlreadyRunning);
        }

        let process = ManagedProcess::spawn(&self.inner.launch, self.inner.console.clone(), self.inner.show_console)
            .await
            .map_err(|e| {
                tracing::error!("{}", e);
                e
            })?;

        if let Err(e) = slot.machine.transition(ServerState::Running) {
            // Slot empty but machine says running: the observer has not caught up.
            tracing::warn!("{}", e);
        }
        slot.generation += 1;
        let generation = slot.generation;
        let exit_rx = process.exit_receiver();
        tracing::info!("Server process started with PID {}", process.pid);
        slot.process = Some(Arc::new(process));
        drop(slot);

        self.observe_exit(generation, exit_rx);
        Ok(())
    }

    fn observe_exit(&self, generation: u64, exit_rx: watch::Receiver<Option<ProcessExit>>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let code = wait_for_exit(exit_rx).await.and_then(|e| e.code);

            let mut slot = inner.slot.lock().await;
            if slot.generation != generation {
                return;
            }
            slot.process = None;
            slot.last_exit_code = code;
            if let Err(e) = slot.machine.transition(ServerState::Stopped) {
                tracing::warn!("{}", e);
            }
            match code {
                Some(code) => tracing::info!("Server process exited with code {}", code),
                None => tracing::info!("Server process exited without an exit code (killed by signal)"),
            }
        });
    }

    /// Ask the server to shut down by sending `stop`. Does not wait.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let Some(process) = self.current().await else {
            tracing::warn!("Attempted to stop server, but server is not running.");
            return Err(SupervisorError::NotRunning);
        };
        process.send_command(STOP_COMMAND).await
    }

    /// Write one line to the server's stdin.
    pub async fn write(&self, command: &str) -> Result<(), SupervisorError> {
        let Some(process) = self.current().await else {
            tracing::warn!("Attempted to write to server, but server is not running.");
            return Err(SupervisorError::NotRunning);
        };
        process.send_command(command).await
    }

    /// Stop and start again.
    ///
    /// A stopped server is simply started. A running one gets `stop`, then a
    /// poll timer and a failsafe timer are armed together: the poll starts the
    /// server once the old process is gone, the failsafe kills it if it is
    /// still there when the timeout hits. Exactly one of them resolves.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        if self
            .inner
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Attempted to restart server, but a restart is already in progress.");
            return Err(SupervisorError::RestartInProgress);
        }
        let _guard = FlagGuard(&self.inner.restarting);

        let Some(generation) = self.running_generation().await else {
            return self.start().await;
        };

        if let Err(e) = self.stop().await {
            tracing::debug!("Stop during restart: {}", e);
        }

        let timings = self.inner.timings;
        let resolved = Arc::new(AtomicBool::new(false));
        let disarm = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Result<(), SupervisorError>>(1);

        // ── poll ─────────────────────────────────────────────
        {
            let sup = self.clone();
            let resolved = resolved.clone();
            let disarm = disarm.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(timings.poll_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = disarm.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if sup.running_generation().await == Some(generation) {
                        continue;
                    }
                    if !claim(&resolved) {
                        return;
                    }
                    disarm.cancel();
                    let _ = tx.send(sup.start().await).await;
                    return;
                }
            });
        }

        // ── failsafe ─────────────────────────────────────────
        {
            let sup = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = disarm.cancelled() => return,
                    _ = tokio::time::sleep(timings.failsafe_timeout) => {}
                }
                if !claim(&resolved) {
                    return;
                }
                disarm.cancel();
                tracing::warn!("Server failed to stop, killing process...");
                sup.kill_generation(generation).await;
                let _ = tx
                    .send(Err(SupervisorError::FailsafeKilled(timings.failsafe_timeout.as_secs())))
                    .await;
            });
        }

        rx.recv().await.unwrap_or(Err(SupervisorError::NotRunning))
    }

    /// Stop for service termination: `stop`, wait up to the failsafe timeout,
    /// then kill. Returns true when the server went down on its own (or was
    /// not running).
    pub async fn shutdown(&self) -> bool {
        let Some(process) = self.current().await else {
            return true;
        };
        let exit_rx = process.exit_receiver();
        if let Err(e) = process.send_command(STOP_COMMAND).await {
            tracing::warn!("Failed to send stop: {}", e);
        }

        match tokio::time::timeout(self.inner.timings.failsafe_timeout, wait_for_exit(exit_rx.clone())).await {
            Ok(_) => {
                tracing::info!("Server stopped, safely shutting down...");
                true
            }
            Err(_) => {
                tracing::warn!("Server took too long to stop, forcing shutdown...");
                process.kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), wait_for_exit(exit_rx)).await;
                false
            }
        }
    }

    /// Console lines with id > `since_id`.
    pub async fn console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.inner.console.lock().await.get_since(since_id)
    }

    pub async fn recent_console(&self, count: usize) -> Vec<LogLine> {
        self.inner.console.lock().await.get_recent(count)
    }

    async fn current(&self) -> Option<Arc<ManagedProcess>> {
        self.inner.slot.lock().await.process.clone()
    }

    async fn running_generation(&self) -> Option<u64> {
        let slot = self.inner.slot.lock().await;
        slot.process.as_ref().map(|_| slot.generation)
    }

    async fn kill_generation(&self, generation: u64) -> bool {
        let slot = self.inner.slot.lock().await;
        match &slot.process {
            Some(process) if slot.generation == generation => {
                process.kill();
                true
            }
            _ => false,
        }
    }
}

fn claim(resolved: &AtomicBool) -> bool {
    resolved
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
