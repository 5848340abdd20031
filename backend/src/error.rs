//! Error types for the inference core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::admission::RepositoryError;
use crate::moderation::ModerationError;

/// Error types for inference operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No endpoint of the requested kind is free.
    #[error("access overload, please try again later")]
    Busy,

    #[error("Failed to connect to endpoint: {0}")]
    Connection(String),

    #[error("Endpoint returned error: {0}")]
    Upstream(String),

    #[error("Content rejected by moderation: {0}")]
    ModerationViolation(String),

    #[error("Moderation unavailable: {0}")]
    ModerationUnavailable(String),

    #[error("Unknown model kind: {0}")]
    UnknownKind(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ModerationError> for Error {
    fn from(err: ModerationError) -> Self {
        match err {
            ModerationError::Violation(reason) => Error::ModerationViolation(reason),
            ModerationError::Unavailable(reason) => Error::ModerationUnavailable(reason),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::Busy => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
            Error::Connection(_) => (StatusCode::BAD_GATEWAY, "connection_error"),
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Error::ModerationViolation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "moderation_violation"),
            Error::ModerationUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "moderation_unavailable"),
            Error::UnknownKind(_) => (StatusCode::NOT_FOUND, "unknown_kind"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
            Error::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, "repository_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Busy.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::Connection("refused".into()).into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::ModerationViolation("bad".into()).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            Error::UnknownKind("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_moderation_error_conversion() {
        let err: Error = ModerationError::Violation("porn".into()).into();
        assert!(matches!(err, Error::ModerationViolation(r) if r == "porn"));
        let err: Error = ModerationError::Unavailable("timeout".into()).into();
        assert!(matches!(err, Error::ModerationUnavailable(_)));
    }
}
