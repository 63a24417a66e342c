use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::relay::RegistryError;
use crate::webrtc::EngineError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Stream already live: {0}")]
    AlreadyLive(String),

    #[error("No such stream: {0}")]
    NoSuchStream(String),

    #[error("No such session: {0}")]
    NoSuchSession(String),

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyLive(id) => AppError::AlreadyLive(id.to_string()),
            RegistryError::NotFound(id) => AppError::NoSuchStream(id.to_string()),
            RegistryError::Released(id) => {
                AppError::EngineFailure(format!("session closed during negotiation of {}", id))
            }
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::EngineFailure(err.to_string())
    }
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::AlreadyLive(_) => StatusCode::CONFLICT,
            AppError::NoSuchStream(_) | AppError::NoSuchSession(_) => StatusCode::NOT_FOUND,
            AppError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            AppError::EngineFailure(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        if status.is_client_error() {
            tracing::warn!(status = status.as_u16(), error_message = %body.message, "Request rejected");
        } else {
            tracing::error!(status = status.as_u16(), error_message = %body.message, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::StreamId;

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(
            AppError::AlreadyLive("abc".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::NoSuchStream("xyz".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::MalformedRequest("missing sdp".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::EngineFailure("ice".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_registry_error_conversion() {
        let id = StreamId::parse("abc").unwrap();
        let err: AppError = RegistryError::AlreadyLive(id.clone()).into();
        assert!(matches!(err, AppError::AlreadyLive(ref s) if s == "abc"));

        let err: AppError = RegistryError::NotFound(id).into();
        assert!(matches!(err, AppError::NoSuchStream(_)));
    }
}
