//! Crate-wide error type.
//!
//! Mirrors the error taxonomy of the download engine: every fallible
//! operation in `registry`, `store` and `engine` returns [`Error`], and
//! the `api` layer converts it to an HTTP response via `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds, not exception types.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// Malformed coordinate, unknown source, bad platform. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 401/403 or token endpoint failure, after the one permitted refresh.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// 404 on manifest or blob, or zero platform matches in a manifest list.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection error, 5xx, truncated read, inactivity timeout. Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unexpected content-type, digest mismatch, unparsable manifest. Fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local disk failure (ENOSPC, permission). Fatal.
    #[error("I/O error: {0}")]
    Io(String),

    /// The task was paused or cancelled; not a user-facing failure.
    #[error("cancelled")]
    Cancelled,

    /// The requested verb is not valid from the task's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Auth(_) => "Auth",
            Error::NotFound(_) => "NotFound",
            Error::Transport(_) => "Transport",
            Error::ProtocolViolation(_) => "ProtocolViolation",
            Error::Io(_) => "IO",
            Error::Cancelled => "Cancelled",
            Error::InvalidState(_) => "InvalidState",
        }
    }

    /// Transient failures the state machine retries up to the task's budget.
    /// `Auth` is handled separately: one token refresh, then fatal, never
    /// counted against this budget or backed off exponentially.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => Error::Transport(format!("I/O timed out: {err}")),
            _ => Error::Io(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Transport(format!("request timed out: {err}"))
        } else if err.is_connect() {
            Error::Transport(format!("connection failed: {err}"))
        } else if err.is_decode() {
            Error::ProtocolViolation(format!("response decode error: {err}"))
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ProtocolViolation(format!("JSON parsing failed: {err}"))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidArgument(format!("invalid URL: {err}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::InvalidArgument(_) | Error::InvalidState(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Auth(_) | Error::Transport(_) | Error::ProtocolViolation(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Cancelled => StatusCode::CONFLICT,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }

        let body = ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
