//! Error types for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use koala_core::{Rejection, RequestError, StagingError};
use serde_json::json;
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that end a request without an execution envelope.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The validator refused the script
    #[error("Script rejected: {0}")]
    Rejected(Rejection),

    /// Datasets could not be staged
    #[error("Dataset staging failed: {0}")]
    Staging(#[from] StagingError),

    /// Every sandbox slot is busy
    #[error("All {capacity} sandbox slots are busy, retry later")]
    Backpressure { capacity: usize },

    /// The request was dropped before its session finished
    #[error("Request cancelled")]
    Cancelled,

    /// Malformed request body
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request body above the configured ceiling
    #[error("Request body too large: {0}")]
    BodyTooLarge(String),

    /// Server configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Staging(e) if e.is_size_limit() => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Staging(_) | ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Backpressure { .. } | ServerError::Cancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServerError::Config(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Rejected(_) => "validation_rejected",
            ServerError::Staging(e) if e.is_size_limit() => "dataset_too_large",
            ServerError::Staging(_) => "staging_error",
            ServerError::Backpressure { .. } => "backpressure",
            ServerError::Cancelled => "cancelled",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::BodyTooLarge(_) => "body_too_large",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }
}

impl From<RequestError> for ServerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::ValidationRejected(rejection) => ServerError::Rejected(rejection),
            RequestError::Staging(e) => ServerError::Staging(e),
            RequestError::Backpressure { capacity } => ServerError::Backpressure { capacity },
            RequestError::Cancelled => ServerError::Cancelled,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::warn!("Request failed: {}", self);
        } else {
            log::info!("Request refused: {}", self);
        }

        let mut body = json!({
            "error": self.error_type(),
            "message": self.to_string(),
            "timestamp": chrono::Utc::now(),
        });
        if let ServerError::Rejected(rejection) = &self {
            body["rejection"] = json!(rejection);
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ServerError::Backpressure { .. }) {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
