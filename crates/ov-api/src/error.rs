//! Error types for ov-api

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed")]
    AuthFailed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Core(#[from] ov_core::Error),
}

/// Body of every error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use ov_core::Error as Core;

        match self {
            ApiError::AuthFailed => StatusCode::UNAUTHORIZED,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(e) => match e {
                Core::Validation(_) => StatusCode::BAD_REQUEST,
                Core::NotFound { .. } => StatusCode::NOT_FOUND,
                Core::ConstraintViolation(_) | Core::InvalidTransition { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ov_core::Error;

    #[test]
    fn test_status_mapping() {
        let status = |e: Error| ApiError::from(e).status();
        assert_eq!(status(Error::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::not_found("job", "j1")), StatusCode::NOT_FOUND);
        assert_eq!(
            status(Error::invalid_transition("session", "completed", "failed")),
            StatusCode::CONFLICT
        );
        assert_eq!(status(Error::ConstraintViolation("fk".into())), StatusCode::CONFLICT);
        assert_eq!(
            status(Error::ProcessSpawn {
                job_id: "j".into(),
                reason: "ENOENT".into()
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::AuthFailed.status(), StatusCode::UNAUTHORIZED);
    }
}
