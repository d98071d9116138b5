use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::{InputError, RegistryError};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - cwd is missing or not an authorized project directory.
    InvalidCwd,
    /// 400 - projectId does not name a known project.
    UnknownProject(String),
    /// 403 - WebSocket upgrade from a disallowed browser origin.
    OriginNotAllowed,
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 409 - The session has no process to write to.
    ProcessUnavailable,
    /// 413 - Decoded input chunk exceeds the size cap.
    InputTooLarge { size: usize, max: usize },
    /// 429 - Per-session input budget exhausted.
    RateLimited,
    /// 503 - Session cap reached.
    MaxSessionsReached,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidCwd => StatusCode::BAD_REQUEST,
            ApiError::UnknownProject(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ProcessUnavailable => StatusCode::CONFLICT,
            ApiError::InputTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::MaxSessionsReached => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidCwd => "invalid_cwd",
            ApiError::UnknownProject(_) => "unknown_project",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::ProcessUnavailable => "process_unavailable",
            ApiError::InputTooLarge { .. } => "input_too_large",
            ApiError::RateLimited => "rate_limited",
            ApiError::MaxSessionsReached => "max_sessions_reached",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidCwd => {
                "cwd must be a known project directory with .multiterm/project.json.".to_string()
            }
            ApiError::UnknownProject(id) => format!("Unknown project: {}.", id),
            ApiError::OriginNotAllowed => "Origin not allowed.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::ProcessUnavailable => "Session process is not accepting input.".to_string(),
            ApiError::InputTooLarge { size, max } => {
                format!("Input chunk of {} bytes exceeds the {} byte limit.", size, max)
            }
            ApiError::RateLimited => "Input rate limit exceeded. Try again shortly.".to_string(),
            ApiError::MaxSessionsReached => "Maximum number of sessions reached.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<InputError> for ApiError {
    fn from(e: InputError) -> Self {
        match e {
            InputError::TooLarge { size, max } => ApiError::InputTooLarge { size, max },
            InputError::RateLimited => ApiError::RateLimited,
            InputError::ProcessUnavailable => ApiError::ProcessUnavailable,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ApiError::SessionNotFound(id),
            RegistryError::InvalidCwd => ApiError::InvalidCwd,
            RegistryError::UnknownProject(id) => ApiError::UnknownProject(id),
            RegistryError::MaxSessionsReached => ApiError::MaxSessionsReached,
            RegistryError::Input(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
