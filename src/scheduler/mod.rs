//! Background loops: periodic backups and the daily restart schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{CountdownStep, KeeperConfig};
use crate::maintenance::MaintenanceOrchestrator;
use crate::supervisor::ProcessSupervisor;

/// Spawn every loop the config enables. Both stop when `shutdown` is cancelled.
pub fn spawn_loops(
    cfg: &KeeperConfig,
    supervisor: ProcessSupervisor,
    orchestrator: Arc<MaintenanceOrchestrator>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if let Some(backups) = AutoBackupLoop::from_config(cfg, orchestrator) {
        handles.push(backups.spawn(shutdown.clone()));
    }
    if let Some(restarts) = AutoRestartLoop::from_config(cfg, supervisor) {
        handles.push(restarts.spawn(shutdown));
    }
    handles
}

pub struct AutoBackupLoop {
    orchestrator: Arc<MaintenanceOrchestrator>,
    interval: Duration,
}

impl AutoBackupLoop {
    pub fn new(orchestrator: Arc<MaintenanceOrchestrator>, interval: Duration) -> Self {
        Self { orchestrator, interval }
    }

    /// `None` unless `backup.auto_backup` is set with a usable interval.
    pub fn from_config(cfg: &KeeperConfig, orchestrator: Arc<MaintenanceOrchestrator>) -> Option<Self> {
        if !cfg.backup.auto_backup {
            return None;
        }
        let interval = cfg.backup.interval();
        if interval.is_zero() {
            tracing::error!("Auto backup is enabled, but the backup interval is not usable.");
            return None;
        }
        Some(Self::new(orchestrator, interval))
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let first = match tokio::time::Instant::now().checked_add(self.interval) {
            Some(at) if !self.interval.is_zero() => at,
            _ => {
                tracing::error!("Auto backup interval {:?} is not usable, loop not started", self.interval);
                return;
            }
        };
        tracing::debug!("Auto backup every {:?}", self.interval);
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.trigger();
                }
            }
        }
        tracing::debug!("Auto backup loop stopped");
    }

    /// Fire one unnamed, unprotected backup without waiting for it. Skipped
    /// when another maintenance operation holds the slot.
    pub fn trigger(&self) -> bool {
        if self.orchestrator.is_busy() {
            tracing::warn!("Skipping scheduled backup, another maintenance operation is in progress.");
            return false;
        }
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.backup(None, None).await {
                tracing::debug!("Scheduled backup failed: {}", e);
            }
        });
        true
    }
}

pub struct AutoRestartLoop {
    supervisor: ProcessSupervisor,
    timings: Vec<String>,
    countdown: Vec<CountdownStep>,
    last_fired: Option<String>,
}

impl AutoRestartLoop {
    pub fn new(supervisor: ProcessSupervisor, timings: Vec<String>, countdown: Vec<CountdownStep>) -> Self {
        Self {
            supervisor,
            timings,
            countdown,
            last_fired: None,
        }
    }

    /// `None` unless `restart.auto_restart` is set and at least one timing exists.
    pub fn from_config(cfg: &KeeperConfig, supervisor: ProcessSupervisor) -> Option<Self> {
        if !cfg.restart.auto_restart {
            return None;
        }
        if cfg.restart.timings.is_empty() {
            tracing::warn!("Auto restart is enabled, but no restart timings are set.");
            return None;
        }
        Some(Self::new(
            supervisor,
            cfg.restart.timings.clone(),
            cfg.restart.countdown.clone(),
        ))
    }

    /// Whether `now` (UTC) falls in one of the configured minutes.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let hhmm = now.format("%H:%M").to_string();
        self.timings.iter().any(|t| *t == hhmm)
    }

    /// One scheduler step. Runs the countdown and restarts the server when
    /// `now` matches a timing and the server is running. A minute fires at
    /// most once. Returns true if a restart was attempted.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        let minute = now.format("%Y-%m-%d %H:%M").to_string();
        if self.last_fired.as_deref() == Some(minute.as_str()) {
            return false;
        }
        self.last_fired = Some(minute);

        if !self.supervisor.is_running().await {
            tracing::debug!("Scheduled restart skipped, server is not running");
            return false;
        }

        tracing::info!("Scheduled restart at {} UTC", now.format("%H:%M"));
        run_countdown(&self.supervisor, &self.countdown).await;
        if let Err(e) = self.supervisor.restart().await {
            tracing::error!("Scheduled restart failed: {}", e);
        }
        true
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("Auto restart at {:?} UTC", self.timings);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(until_next_minute(Utc::now())) => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tick(Utc::now()) => {}
            }
        }
        tracing::debug!("Auto restart loop stopped");
    }
}

/// Write each step's commands, then wait its delay. Write failures are
/// logged and do not abort the countdown.
pub async fn run_countdown(supervisor: &ProcessSupervisor, steps: &[CountdownStep]) {
    for step in steps {
        for command in step.commands.iter().flatten() {
            if let Err(e) = supervisor.write(command).await {
                tracing::warn!("Countdown command '{}' failed: {}", command, e);
            }
        }
        tokio::time::sleep(step.delay()).await;
    }
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::from_secs(now.second() as u64)
        + Duration::from_nanos(now.nanosecond().min(999_999_999) as u64);
    Duration::from_secs(60).saturating_sub(into_minute)
}
