//! Maintenance outcomes. The scripts only speak through exit codes; those
//! codes are mapped onto [`ScriptFailure`] per operation and carried to the
//! caller inside [`MaintenanceError`].

use axum::http::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Backup,
    Restore,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Install => "install",
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptFailure {
    #[error("missing required input")]
    MissingInput,

    #[error("server already installed")]
    AlreadyInstalled,

    #[error("cache path in use")]
    CachePathBusy,

    #[error("server not found")]
    ServerNotFound,

    #[error("backup not found")]
    BackupNotFound,

    #[error("timed out after {0}s")]
    TimedOut(u64),

    #[error("reason unknown (exit code {0:?})")]
    Unknown(Option<i32>),
}

impl ScriptFailure {
    /// Map an exit code onto the operation's failure taxonomy.
    /// `Ok(())` for exit code 0.
    pub fn classify(operation: Operation, code: Option<i32>) -> Result<(), ScriptFailure> {
        let failure = match (operation, code) {
            (_, Some(0)) => return Ok(()),
            (_, Some(1)) => ScriptFailure::MissingInput,
            (Operation::Install, Some(2)) => ScriptFailure::AlreadyInstalled,
            (Operation::Backup | Operation::Restore, Some(2)) => ScriptFailure::CachePathBusy,
            (Operation::Backup, Some(3)) => ScriptFailure::ServerNotFound,
            (Operation::Restore, Some(3)) => ScriptFailure::BackupNotFound,
            (_, other) => ScriptFailure::Unknown(other),
        };
        Err(failure)
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingInput => "MISSING_INPUT",
            Self::AlreadyInstalled => "ALREADY_INSTALLED",
            Self::CachePathBusy => "CACHE_PATH_BUSY",
            Self::ServerNotFound => "SERVER_NOT_FOUND",
            Self::BackupNotFound => "BACKUP_NOT_FOUND",
            Self::TimedOut(_) => "TIMED_OUT",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MaintenanceError {
    #[error("Server is already installed")]
    AlreadyInstalled,

    #[error("Server is running, stop it first")]
    ServerRunning,

    #[error("Another maintenance operation is in progress")]
    Busy,

    #[error("Backup '{0}' not found")]
    BackupNotFound(Uuid),

    #[error("Server {operation} failed: {failure}")]
    Script {
        operation: Operation,
        failure: ScriptFailure,
    },

    #[error("Failed to run {operation} script '{script}': {source}")]
    Spawn {
        operation: Operation,
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Catalog(CatalogError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CatalogError> for MaintenanceError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => MaintenanceError::BackupNotFound(id),
            other => MaintenanceError::Catalog(other),
        }
    }
}

impl MaintenanceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyInstalled | Self::ServerRunning | Self::Busy => StatusCode::CONFLICT,
            Self::BackupNotFound(_) => StatusCode::NOT_FOUND,
            Self::Script { failure, .. } => match failure {
                ScriptFailure::AlreadyInstalled | ScriptFailure::CachePathBusy => StatusCode::CONFLICT,
                ScriptFailure::ServerNotFound | ScriptFailure::BackupNotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Spawn { .. } | Self::Catalog(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyInstalled => "ALREADY_INSTALLED",
            Self::ServerRunning => "SERVER_RUNNING",
            Self::Busy => "MAINTENANCE_BUSY",
            Self::BackupNotFound(_) => "BACKUP_NOT_FOUND",
            Self::Script { failure, .. } => failure.error_code(),
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Catalog(_) => "CATALOG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for MaintenanceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
