use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{ApiError, CommandRequest, ConsoleQuery, IPCServer, InstallRequest};

const DEFAULT_CONSOLE_LINES: usize = 100;

/// GET /api/server
pub async fn status(State(state): State<IPCServer>) -> Json<Value> {
    let status = state.supervisor.status().await;
    Json(json!({
        "success": true,
        "server": status,
        "maintenance_busy": state.orchestrator.is_busy(),
    }))
}

/// POST /api/server/start
pub async fn start(State(state): State<IPCServer>) -> Result<Json<Value>, ApiError> {
    state.supervisor.start().await?;
    Ok(Json(json!({ "success": true, "message": "Server started" })))
}

/// POST /api/server/stop - sends `stop`, does not wait for the exit
pub async fn stop(State(state): State<IPCServer>) -> Result<Json<Value>, ApiError> {
    state.supervisor.stop().await?;
    Ok(Json(json!({ "success": true, "message": "Stop command sent" })))
}

/// POST /api/server/restart
pub async fn restart(State(state): State<IPCServer>) -> Result<Json<Value>, ApiError> {
    state.supervisor.restart().await?;
    Ok(Json(json!({ "success": true, "message": "Server restarted" })))
}

/// POST /api/server/command
pub async fn command(
    State(state): State<IPCServer>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    state.supervisor.write(&req.command).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/server/console?since=N&count=M
pub async fn console(
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> Json<Value> {
    let lines = match query.since {
        Some(since) => state.supervisor.console_since(since).await,
        None => {
            state
                .supervisor
                .recent_console(query.count.unwrap_or(DEFAULT_CONSOLE_LINES))
                .await
        }
    };
    Json(json!({ "success": true, "lines": lines }))
}

/// POST /api/server/install
pub async fn install(
    State(state): State<IPCServer>,
    payload: Result<Json<InstallRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    state.orchestrator.install(&req.link).await?;
    Ok(Json(json!({ "success": true, "message": "Server installed" })))
}

/// POST /api/service/shutdown - the binary stops the server and exits
pub async fn shutdown_service(State(state): State<IPCServer>) -> Json<Value> {
    tracing::info!("Shutdown requested through the control API");
    state.shutdown.cancel();
    Json(json!({ "success": true, "message": "Shutting down" }))
}
