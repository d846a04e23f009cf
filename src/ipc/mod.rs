pub mod auth;
pub mod handlers;

use anyhow::Result;
use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::maintenance::{MaintenanceError, MaintenanceOrchestrator};
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use auth::AuthFailLog;

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallRequest {
    pub link: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub protected: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Partial update of a backup record. An empty name clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupUpdateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// Every failure a handler can answer with.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),

    #[error("Invalid backup id '{0}'")]
    InvalidId(String),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            ApiError::Supervisor(e) => e.into_response(),
            ApiError::Maintenance(e) => e.into_response(),
            other => {
                let body = json!({
                    "success": false,
                    "error": other.to_string(),
                    "error_code": "BAD_REQUEST",
                });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}

/// Control API state
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: ProcessSupervisor,
    pub orchestrator: Arc<MaintenanceOrchestrator>,
    pub listen_addr: String,
    token: Arc<String>,
    shutdown: CancellationToken,
    auth_failures: Arc<AuthFailLog>,
}

impl IPCServer {
    pub fn new(
        supervisor: ProcessSupervisor,
        orchestrator: Arc<MaintenanceOrchestrator>,
        listen_addr: &str,
        token: &str,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            orchestrator,
            listen_addr: listen_addr.to_string(),
            token: Arc::new(token.to_string()),
            shutdown,
            auth_failures: Arc::new(AuthFailLog::default()),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/server", get(handlers::server::status))
            .route("/api/server/start", post(handlers::server::start))
            .route("/api/server/stop", post(handlers::server::stop))
            .route("/api/server/restart", post(handlers::server::restart))
            .route("/api/server/command", post(handlers::server::command))
            .route("/api/server/console", get(handlers::server::console))
            .route("/api/server/install", post(handlers::server::install))
            .route("/api/backups", get(handlers::backups::list).post(handlers::backups::create))
            .route(
                "/api/backups/:id",
                patch(handlers::backups::update).delete(handlers::backups::delete),
            )
            .route("/api/backups/:id/restore", post(handlers::backups::restore))
            .route("/api/service/shutdown", post(handlers::server::shutdown_service))
            .layer(middleware::from_fn_with_state(self.clone(), auth::auth_middleware))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn start(self) -> Result<()> {
        tracing::info!("Control API starting on {}", self.listen_addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("Control API listening on http://{}", self.listen_addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
