use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{queue::QueueError, store::StoreError};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("submission not found")]
    NotFound,
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl JudgeError {
    pub fn code(&self) -> &'static str {
        match self {
            JudgeError::UnsupportedLanguage(_) => "unsupported_language",
            JudgeError::InvalidRequest(_) => "invalid_request",
            JudgeError::NotFound => "not_found",
            JudgeError::QueueUnavailable(_) => "queue_unavailable",
            JudgeError::Persistence(_) => "persistence_failure",
            JudgeError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            JudgeError::UnsupportedLanguage(_) | JudgeError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            JudgeError::NotFound => StatusCode::NOT_FOUND,
            JudgeError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            JudgeError::Persistence(_) | JudgeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for JudgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<QueueError> for JudgeError {
    fn from(value: QueueError) -> Self {
        Self::QueueUnavailable(value.to_string())
    }
}

impl From<StoreError> for JudgeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::NotFound,
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitter_errors_are_client_errors() {
        assert_eq!(
            JudgeError::UnsupportedLanguage("cobol".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            JudgeError::QueueUnavailable("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert!(JudgeError::Persistence("disk".into()).status().is_server_error());
    }
}
