//! Shared fixtures: a data directory in a tempdir, shell stand-ins for the
//! server and the maintenance scripts.
#![allow(dead_code)]

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bedrock_keeper::catalog::BackupCatalog;
use bedrock_keeper::config::DataPaths;
use bedrock_keeper::maintenance::MaintenanceOrchestrator;
use bedrock_keeper::retention::BackupRetentionManager;
use bedrock_keeper::supervisor::managed_process::LaunchSpec;
use bedrock_keeper::supervisor::{ProcessSupervisor, StopTimings};

pub const SERVER_EXECUTABLE: &str = "./bedrock_server";

/// Echoes every stdin line, exits 0 on `stop`.
pub const ECHO_SERVER: &str = r#"echo "Server started"
while IFS= read -r line; do
  echo "cmd: $line"
  if [ "$line" = "stop" ]; then
    echo "Quit correctly"
    exit 0
  fi
done"#;

/// Echoes stdin but never exits on `stop`.
pub const STUBBORN_SERVER: &str = r#"echo "Server started"
while IFS= read -r line; do
  echo "cmd: $line"
done"#;

pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub paths: DataPaths,
    pub supervisor: ProcessSupervisor,
    pub catalog: Arc<BackupCatalog>,
    pub orchestrator: Arc<MaintenanceOrchestrator>,
}

pub fn fast_timings() -> StopTimings {
    StopTimings {
        poll_interval: Duration::from_millis(50),
        failsafe_timeout: Duration::from_secs(1),
    }
}

/// A fresh data directory. With `server` set, the server is installed with
/// that script body as its executable.
pub fn harness(server: Option<&str>, retention: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = DataPaths::new(&dir.path().join("data"), &dir.path().join("scripts"));
    paths.ensure().unwrap();
    if let Some(body) = server {
        install_server(&paths.server_dir, body);
    }

    let supervisor = ProcessSupervisor::new(
        LaunchSpec {
            server_dir: paths.server_dir.clone(),
            executable: SERVER_EXECUTABLE.into(),
            args: vec![],
        },
        false,
        fast_timings(),
        1000,
    );
    let catalog = Arc::new(BackupCatalog::new(&paths.catalog_file));
    let retention = BackupRetentionManager::new(catalog.clone(), &paths.backup_dir, retention)
        .with_deletion_delay(Duration::from_millis(1));
    let orchestrator = Arc::new(
        MaintenanceOrchestrator::new(
            paths.clone(),
            supervisor.clone(),
            catalog.clone(),
            retention,
            Duration::from_secs(20),
        )
        .with_settle_delay(Duration::from_millis(10)),
    );

    Harness { dir, paths, supervisor, catalog, orchestrator }
}

pub fn install_server(server_dir: &Path, body: &str) {
    write_script(&server_dir.join(SERVER_EXECUTABLE), body);
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn console_lines(supervisor: &ProcessSupervisor) -> Vec<String> {
    supervisor
        .recent_console(1000)
        .await
        .into_iter()
        .map(|l| l.content)
        .collect()
}

pub async fn console_contains(supervisor: &ProcessSupervisor, needle: &str) -> bool {
    console_lines(supervisor).await.iter().any(|l| l == needle)
}
