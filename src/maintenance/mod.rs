//! Install / backup / restore through external scripts, plus the catalog
//! edits that go with them.

pub mod error;
pub mod script;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

pub use error::{MaintenanceError, Operation, ScriptFailure};
use script::run_script;

use crate::catalog::{BackupCatalog, BackupRecord};
use crate::config::{DataPaths, KeeperConfig};
use crate::retention::{remove_artifact, BackupRetentionManager};
use crate::supervisor::ProcessSupervisor;

/// Pause between a successful backup and the retention sweep.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub record: BackupRecord,
    /// Old backups removed by the retention sweep that followed.
    pub deleted: usize,
}

pub struct MaintenanceOrchestrator {
    paths: DataPaths,
    supervisor: ProcessSupervisor,
    catalog: Arc<BackupCatalog>,
    retention: BackupRetentionManager,
    script_timeout: Duration,
    settle_delay: Duration,
    busy: AtomicBool,
}

impl MaintenanceOrchestrator {
    pub fn new(
        paths: DataPaths,
        supervisor: ProcessSupervisor,
        catalog: Arc<BackupCatalog>,
        retention: BackupRetentionManager,
        script_timeout: Duration,
    ) -> Self {
        Self {
            paths,
            supervisor,
            catalog,
            retention,
            script_timeout,
            settle_delay: SETTLE_DELAY,
            busy: AtomicBool::new(false),
        }
    }

    pub fn from_config(cfg: &KeeperConfig, supervisor: ProcessSupervisor, catalog: Arc<BackupCatalog>) -> Self {
        let paths = cfg.data_paths();
        let retention = BackupRetentionManager::new(
            catalog.clone(),
            &paths.backup_dir,
            cfg.backup.auto_backup_retention,
        );
        Self::new(
            paths,
            supervisor,
            catalog,
            retention,
            Duration::from_secs(cfg.maintenance.script_timeout_secs),
        )
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    pub fn retention(&self) -> &BackupRetentionManager {
        &self.retention
    }

    /// True while an install, backup, restore or delete is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Download and unpack the server from `link`.
    pub async fn install(&self, link: &str) -> Result<(), MaintenanceError> {
        if self.supervisor.is_installed() {
            tracing::warn!("Attempted to install server, but server is already installed.");
            return Err(MaintenanceError::AlreadyInstalled);
        }
        let _slot = self.acquire()?;

        let env = [
            ("serverlink", link.to_string()),
            ("serverpath", path_var(&self.paths.server_dir)),
        ];
        self.run(Operation::Install, &self.paths.install_script, &env).await?;

        tracing::info!("Server installed successfully");
        Ok(())
    }

    /// Archive the server directory under a fresh id, record it, then apply
    /// retention.
    pub async fn backup(
        &self,
        protected: Option<bool>,
        name: Option<String>,
    ) -> Result<BackupOutcome, MaintenanceError> {
        let _slot = self.acquire()?;

        let id = Uuid::new_v4();
        let env = [
            ("cachepath", path_var(&self.paths.cache_dir)),
            ("backuppath", path_var(&self.paths.backup_dir)),
            ("backupname", id.to_string()),
            ("serverpath", path_var(&self.paths.server_dir)),
        ];
        self.run(Operation::Backup, &self.paths.backup_script, &env).await?;

        let record = BackupRecord::new(id, name, protected.unwrap_or(false));
        self.catalog.append(record.clone()).await?;

        tokio::time::sleep(self.settle_delay).await;

        // A failed sweep does not fail the backup.
        let deleted = match self.retention.enforce().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to delete old backups: {}", e);
                e.deleted()
            }
        };

        tracing::info!("Server backed up successfully! Deleted {} old backups.", deleted);
        Ok(BackupOutcome { record, deleted })
    }

    /// Unpack backup `id` over the server directory. The server must be stopped.
    pub async fn restore(&self, id: Uuid) -> Result<(), MaintenanceError> {
        if self.supervisor.is_running().await {
            tracing::warn!("Attempted to restore backup, but server is running. Stop the server first.");
            return Err(MaintenanceError::ServerRunning);
        }
        let _slot = self.acquire()?;

        if self.catalog.get(id).await?.is_none() {
            tracing::error!("Backup {} not found.", id);
            return Err(MaintenanceError::BackupNotFound(id));
        }

        let env = [
            ("cachepath", path_var(&self.paths.cache_dir)),
            ("backuppath", path_var(&self.paths.backup_dir)),
            ("filename", id.to_string()),
            ("serverpath", path_var(&self.paths.server_dir)),
        ];
        self.run(Operation::Restore, &self.paths.restore_script, &env).await?;

        tracing::info!("Restored backup successfully");
        Ok(())
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>, MaintenanceError> {
        Ok(self.catalog.list_newest_first().await?)
    }

    pub async fn rename_backup(&self, id: Uuid, name: Option<String>) -> Result<BackupRecord, MaintenanceError> {
        let record = self.catalog.set_name(id, name).await?;
        tracing::info!("Renamed backup {}", id);
        Ok(record)
    }

    pub async fn set_protected(&self, id: Uuid, protected: bool) -> Result<BackupRecord, MaintenanceError> {
        let record = self.catalog.set_protected(id, protected).await?;
        tracing::info!(
            "Backup {} is now {}",
            id,
            if protected { "protected" } else { "unprotected" }
        );
        Ok(record)
    }

    /// Remove a backup's artifact and record, protected or not.
    pub async fn delete_backup(&self, id: Uuid) -> Result<BackupRecord, MaintenanceError> {
        let _slot = self.acquire()?;

        let Some(record) = self.catalog.get(id).await? else {
            return Err(MaintenanceError::BackupNotFound(id));
        };
        remove_artifact(&self.paths.backup_dir.join(record.artifact_name())).await?;
        let removed = self.catalog.remove(id).await?;
        tracing::info!("Deleted backup {}", id);
        Ok(removed)
    }

    async fn run(
        &self,
        operation: Operation,
        script: &Path,
        env: &[(&str, String)],
    ) -> Result<(), MaintenanceError> {
        let result = match run_script(operation, script, env, self.script_timeout).await {
            Ok(code) => ScriptFailure::classify(operation, code),
            Err(MaintenanceError::Script { failure, .. }) => Err(failure),
            Err(e) => {
                tracing::error!("{}", e);
                return Err(e);
            }
        };

        result.map_err(|failure| {
            log_failure(operation, &failure);
            MaintenanceError::Script { operation, failure }
        })
    }

    fn acquire(&self) -> Result<SlotGuard<'_>, MaintenanceError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Another maintenance operation is in progress.");
            return Err(MaintenanceError::Busy);
        }
        Ok(SlotGuard(&self.busy))
    }
}

struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn path_var(path: &Path) -> String {
    path.display().to_string()
}

fn log_failure(operation: Operation, failure: &ScriptFailure) {
    match failure {
        ScriptFailure::MissingInput => {
            tracing::error!("Server {} failed: missing required input.", operation)
        }
        ScriptFailure::AlreadyInstalled => {
            tracing::warn!("Server {} failed: server is already installed.", operation)
        }
        ScriptFailure::CachePathBusy => {
            tracing::warn!("Server {} failed: cache path is already in use.", operation)
        }
        ScriptFailure::ServerNotFound => {
            tracing::warn!("Server {} failed: server not found.", operation)
        }
        ScriptFailure::BackupNotFound => {
            tracing::error!("Server {} failed: backup not found.", operation)
        }
        ScriptFailure::TimedOut(secs) => {
            tracing::error!("Server {} failed: script timed out after {}s.", operation, secs)
        }
        ScriptFailure::Unknown(code) => {
            tracing::error!("Server {} failed, reason unknown (exit code {:?}).", operation, code)
        }
    }
}
