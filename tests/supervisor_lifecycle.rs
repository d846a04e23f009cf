#![cfg(unix)]

mod common;

use std::time::Duration;

use bedrock_keeper::supervisor::state_machine::ServerState;
use bedrock_keeper::supervisor::SupervisorError;
use common::{console_contains, harness, wait_until, ECHO_SERVER, STUBBORN_SERVER};

#[tokio::test]
async fn test_start_write_stop() {
    let h = harness(Some(ECHO_SERVER), 10);
    h.supervisor.start().await.unwrap();
    assert!(h.supervisor.is_running().await);
    assert_eq!(h.supervisor.status().await.state, ServerState::Running);

    h.supervisor.write("say hello").await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || console_contains(&h.supervisor, "cmd: say hello")).await);

    h.supervisor.stop().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);

    let status = h.supervisor.status().await;
    assert_eq!(status.state, ServerState::Stopped);
    assert_eq!(status.last_exit_code, Some(0));
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_concurrent_starts_spawn_one_process() {
    let h = harness(Some(ECHO_SERVER), 10);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let sup = h.supervisor.clone();
        tasks.push(tokio::spawn(async move { sup.start().await }));
    }

    let mut started = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => started += 1,
            Err(SupervisorError::AlreadyRunning) => refused += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(refused, 7);

    let started_lines = common::console_lines(&h.supervisor)
        .await
        .into_iter()
        .filter(|l| l.starts_with("Process started with PID"))
        .count();
    assert_eq!(started_lines, 1);

    assert!(h.supervisor.shutdown().await);
}

#[tokio::test]
async fn test_restart_replaces_process() {
    let h = harness(Some(ECHO_SERVER), 10);
    h.supervisor.start().await.unwrap();
    let old_pid = h.supervisor.status().await.pid.unwrap();

    h.supervisor.restart().await.unwrap();

    let status = h.supervisor.status().await;
    assert_eq!(status.state, ServerState::Running);
    assert_ne!(status.pid, Some(old_pid));
    assert_eq!(status.last_exit_code, Some(0));
    assert!(wait_until(Duration::from_secs(2), || console_contains(&h.supervisor, "Quit correctly")).await);

    assert!(h.supervisor.shutdown().await);
}

#[tokio::test]
async fn test_restart_of_stopped_server_starts_it() {
    let h = harness(Some(ECHO_SERVER), 10);
    h.supervisor.restart().await.unwrap();
    assert!(h.supervisor.is_running().await);
    assert!(h.supervisor.shutdown().await);
}

#[tokio::test]
async fn test_restart_failsafe_kills_stubborn_server() {
    let h = harness(Some(STUBBORN_SERVER), 10);
    h.supervisor.start().await.unwrap();

    let started = std::time::Instant::now();
    let res = h.supervisor.restart().await;
    assert!(matches!(res, Err(SupervisorError::FailsafeKilled(_))));
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);
    // killed by signal, and not started again
    assert_eq!(h.supervisor.last_exit_code().await, None);
    assert!(wait_until(Duration::from_secs(2), || console_contains(&h.supervisor, "cmd: stop")).await);
}

#[tokio::test]
async fn test_concurrent_restart_is_refused() {
    let h = harness(Some(STUBBORN_SERVER), 10);
    h.supervisor.start().await.unwrap();

    let first = {
        let sup = h.supervisor.clone();
        tokio::spawn(async move { sup.restart().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(h.supervisor.restart().await, Err(SupervisorError::RestartInProgress)));

    let _ = first.await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);
}

#[tokio::test]
async fn test_exit_code_is_recorded() {
    let h = harness(Some("echo crashing\nexit 7"), 10);
    h.supervisor.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);
    assert_eq!(h.supervisor.last_exit_code().await, Some(7));

    // the slot is free again
    h.supervisor.start().await.unwrap();
    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);
}

#[tokio::test]
async fn test_shutdown_kills_stubborn_server() {
    let h = harness(Some(STUBBORN_SERVER), 10);
    h.supervisor.start().await.unwrap();
    assert!(!h.supervisor.shutdown().await);
    assert!(wait_until(Duration::from_secs(3), || async { !h.supervisor.is_running().await }).await);
}
