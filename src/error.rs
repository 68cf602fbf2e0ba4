// Error taxonomy for control-plane operations
//
// Asynchronous failures (process crash, assistant error) never surface here;
// they reach clients only through the event stream or status queries.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevdeckError {
    /// Start requested for a key with a live handle
    #[error("project '{0}' already has a running process")]
    AlreadyRunning(String),

    /// OS failed to create the process (bad binary, bad cwd, permission)
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Start requested without a command and no detection collaborator
    #[error("no command provided and no start command could be detected")]
    MissingCommand,

    /// Assistant execute requested with nothing to do
    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// Status/stream requested for a session that was never created
    #[error("unknown assistant session '{0}'")]
    UnknownSession(String),

    #[error("assistant engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl DevdeckError {
    fn status_code(&self) -> StatusCode {
        match self {
            DevdeckError::AlreadyRunning(_) => StatusCode::CONFLICT,
            DevdeckError::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DevdeckError::MissingCommand => StatusCode::BAD_REQUEST,
            DevdeckError::EmptyPrompt => StatusCode::BAD_REQUEST,
            DevdeckError::UnknownSession(_) => StatusCode::NOT_FOUND,
            DevdeckError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for DevdeckError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}
