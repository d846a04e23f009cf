//! One-shot script runner.
//!
//! Scripts receive their inputs as environment variables only; the
//! environment is cleared first so nothing else leaks in (PATH is kept so
//! the scripts can find their tools). The only result is the exit code.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::{MaintenanceError, Operation, ScriptFailure};
use crate::utils::captured_command;

/// How long output forwarding may lag behind the script's exit. A background
/// child that inherited the pipes keeps them open past that point.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run `script` to completion and return its exit code (`None` when it was
/// terminated by a signal).
pub async fn run_script(
    operation: Operation,
    script: &Path,
    env: &[(&str, String)],
    timeout: Duration,
) -> Result<Option<i32>, MaintenanceError> {
    tracing::debug!("Running {} script {}", operation, script.display());

    let mut cmd = captured_command(script, std::process::Stdio::null());
    cmd.env_clear().kill_on_drop(true);
    if let Ok(path) = std::env::var("PATH") {
        cmd.env("PATH", path);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|e| MaintenanceError::Spawn {
        operation,
        script: script.display().to_string(),
        source: e,
    })?;

    let stdout = child.stdout.take().map(|pipe| tokio::spawn(forward_lines(operation, pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(forward_lines(operation, pipe)));

    let deadline = Instant::now() + timeout;
    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            tracing::warn!(
                "{} script timed out after {}s, killing process",
                operation,
                timeout.as_secs()
            );
            let _ = child.kill().await;
            abort_forwarders([stdout, stderr]);
            return Err(MaintenanceError::Script {
                operation,
                failure: ScriptFailure::TimedOut(timeout.as_secs()),
            });
        }
    };

    let drain_until = (Instant::now() + DRAIN_GRACE).min(deadline);
    for mut handle in [stdout, stderr].into_iter().flatten() {
        if tokio::time::timeout_at(drain_until, &mut handle).await.is_err() {
            tracing::debug!("{} script left its output open, no longer forwarding it", operation);
            handle.abort();
        }
    }

    tracing::debug!("{} script finished with {}", operation, status);
    Ok(status.code())
}

fn abort_forwarders(handles: [Option<JoinHandle<()>>; 2]) {
    for handle in handles.into_iter().flatten() {
        handle.abort();
    }
}

async fn forward_lines<R>(operation: Operation, pipe: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("[{}] {}", operation, line);
    }
}
