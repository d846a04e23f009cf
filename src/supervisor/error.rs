//! Supervisor error type. Kinds are kept apart so the control API can map
//! them onto HTTP status codes.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Server is not installed")]
    NotInstalled,

    #[error("A restart is already in progress")]
    RestartInProgress,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server stdin is closed")]
    StdinClosed,

    #[error("Server did not stop within {0}s and was killed")]
    FailsafeKilled(u64),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyRunning | Self::NotRunning | Self::RestartInProgress => StatusCode::CONFLICT,
            Self::NotInstalled => StatusCode::CONFLICT,
            Self::Spawn { .. } | Self::StdinClosed | Self::FailsafeKilled(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::NotInstalled => "NOT_INSTALLED",
            Self::RestartInProgress => "RESTART_IN_PROGRESS",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::StdinClosed => "STDIN_CLOSED",
            Self::FailsafeKilled(_) => "FAILSAFE_KILLED",
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

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
