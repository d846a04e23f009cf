use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use super::super::{ApiError, BackupRequest, BackupUpdateRequest, IPCServer};

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::InvalidId(raw.to_string()))
}

/// GET /api/backups - newest first
pub async fn list(State(state): State<IPCServer>) -> Result<Json<Value>, ApiError> {
    let backups = state.orchestrator.list_backups().await?;
    Ok(Json(json!({ "success": true, "backups": backups })))
}

/// POST /api/backups - body optional
pub async fn create(
    State(state): State<IPCServer>,
    payload: Option<Json<BackupRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = payload.map(|Json(r)| r).unwrap_or_default();
    let outcome = state.orchestrator.backup(req.protected, req.name).await?;
    Ok(Json(json!({
        "success": true,
        "backup": outcome.record,
        "deleted": outcome.deleted,
    })))
}

/// PATCH /api/backups/:id
pub async fn update(
    State(state): State<IPCServer>,
    Path(id): Path<String>,
    payload: Result<Json<BackupUpdateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if req.name.is_none() && req.protected.is_none() {
        return Err(ApiError::BadRequest("nothing to update".to_string()));
    }

    let mut record = None;
    if let Some(name) = req.name {
        let name = Some(name).filter(|n| !n.trim().is_empty());
        record = Some(state.orchestrator.rename_backup(id, name).await?);
    }
    if let Some(protected) = req.protected {
        record = Some(state.orchestrator.set_protected(id, protected).await?);
    }
    Ok(Json(json!({ "success": true, "backup": record })))
}

/// DELETE /api/backups/:id
pub async fn delete(State(state): State<IPCServer>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let removed = state.orchestrator.delete_backup(id).await?;
    Ok(Json(json!({ "success": true, "backup": removed })))
}

/// POST /api/backups/:id/restore
pub async fn restore(State(state): State<IPCServer>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    state.orchestrator.restore(id).await?;
    Ok(Json(json!({ "success": true, "message": "Backup restored" })))
}
