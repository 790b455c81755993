use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

/// Error taxonomy for the coordination core. Every failure path is an
/// explicit value of this type; panics are reserved for invariant
/// violations that indicate a programming bug.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("unknown command: {0}")]
    UnknownCommand(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no agent available")]
    NoAgentAvailable,

    #[error("agent_disconnected")]
    AgentDisconnected,

    #[error("timeout")]
    Timeout,

    #[error("platform error: {0}")]
    Platform(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether a failed `start_session` may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAgentAvailable | Self::AgentDisconnected)
    }
}

/// HTTP-facing error wrapper for the axum handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "error": "unauthorized" }),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": msg }),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unauthorized => Self::Unauthorized,
            CoreError::UnknownAgent(id) => Self::NotFound(format!("agent {id}")),
            CoreError::UnknownSession(id) => Self::NotFound(format!("session {id}")),
            CoreError::UnknownCommand(id) => Self::NotFound(format!("command {id}")),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            CoreError::NoAgentAvailable => Self::ServiceUnavailable("no agent available".into()),
            CoreError::AgentDisconnected => Self::ServiceUnavailable("agent disconnected".into()),
            CoreError::Timeout => Self::ServiceUnavailable("command timed out".into()),
            CoreError::Platform(msg) => Self::BadRequest(msg),
            CoreError::MalformedFrame(msg) => Self::BadRequest(msg),
            CoreError::Db(e) => Self::Internal(e.into()),
            CoreError::Other(e) => Self::Internal(e),
        }
    }
}
