//! Wires the long-lived services together from one config.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::BackupCatalog;
use crate::config::{DataPaths, KeeperConfig};
use crate::ipc::IPCServer;
use crate::maintenance::MaintenanceOrchestrator;
use crate::scheduler;
use crate::supervisor::ProcessSupervisor;

pub struct Keeper {
    pub config: KeeperConfig,
    pub paths: DataPaths,
    pub supervisor: ProcessSupervisor,
    pub catalog: Arc<BackupCatalog>,
    pub orchestrator: Arc<MaintenanceOrchestrator>,
    pub shutdown: CancellationToken,
}

impl Keeper {
    pub fn new(config: KeeperConfig) -> Self {
        let paths = config.data_paths();
        let supervisor = ProcessSupervisor::from_config(&config);
        let catalog = Arc::new(BackupCatalog::new(&paths.catalog_file));
        let orchestrator = Arc::new(MaintenanceOrchestrator::from_config(
            &config,
            supervisor.clone(),
            catalog.clone(),
        ));
        Self {
            config,
            paths,
            supervisor,
            catalog,
            orchestrator,
            shutdown: CancellationToken::new(),
        }
    }

    /// Create missing directories and sweep artifacts the catalog does not know.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        self.paths.ensure()?;
        if let Err(e) = self.orchestrator.retention().reconcile_orphans().await {
            tracing::error!("Failed to clean up hanged backups: {}", e);
        }
        Ok(())
    }

    pub fn spawn_schedulers(&self) -> Vec<JoinHandle<()>> {
        scheduler::spawn_loops(
            &self.config,
            self.supervisor.clone(),
            self.orchestrator.clone(),
            self.shutdown.clone(),
        )
    }

    pub fn ipc_server(&self, token: &str) -> IPCServer {
        IPCServer::new(
            self.supervisor.clone(),
            self.orchestrator.clone(),
            &self.config.ipc.listen_addr,
            token,
            self.shutdown.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> KeeperConfig {
        let mut config = KeeperConfig::default();
        config.paths.data_dir = dir.join("data");
        config.paths.scripts_dir = dir.join("scripts");
        config
    }

    #[tokio::test]
    async fn test_prepare_keeps_artifacts_when_catalog_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Keeper::new(config_in(dir.path()));
        std::fs::create_dir_all(&keeper.paths.backup_dir).unwrap();
        let artifact = keeper.paths.backup_dir.join("5b0e7d52-3f0e-4c59-9f41-7d2a1c9e8b60.tar.gz");
        std::fs::write(&artifact, b"tarball").unwrap();

        keeper.prepare().await.unwrap();
        assert!(artifact.is_file());
        assert!(!keeper.paths.catalog_file.exists());
    }

    #[tokio::test]
    async fn test_prepare_initializes_fresh_layout() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = Keeper::new(config_in(dir.path()));
        keeper.prepare().await.unwrap();
        assert!(keeper.paths.backup_dir.is_dir());
        assert!(keeper.catalog.load().await.unwrap().is_empty());

        let stray = keeper.paths.backup_dir.join("stray.tar.gz");
        std::fs::write(&stray, b"x").unwrap();
        keeper.prepare().await.unwrap();
        assert!(!stray.exists());
    }
}
