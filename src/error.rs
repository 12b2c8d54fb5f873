//! Domain-specific error types for parallizer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the parallizer backend
#[derive(Error, Debug)]
pub enum ParallizerError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ParallizerError {
    pub fn validation(message: impl Into<String>) -> Self {
        ParallizerError::Validation {
            message: message.into(),
        }
    }

    /// HTTP status used by the axum binding
    pub fn status(&self) -> StatusCode {
        match self {
            ParallizerError::Validation { .. } => StatusCode::BAD_REQUEST,
            ParallizerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ParallizerError::Serialization { .. }
            | ParallizerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ParallizerError {
    fn from(err: anyhow::Error) -> Self {
        ParallizerError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ParallizerError {
    fn from(err: serde_json::Error) -> Self {
        ParallizerError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<axum::extract::rejection::JsonRejection> for ParallizerError {
    fn from(err: axum::extract::rejection::JsonRejection) -> Self {
        ParallizerError::Validation {
            message: err.body_text(),
        }
    }
}

/// Convert ParallizerError to an HTTP response
impl IntoResponse for ParallizerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Result type alias for parallizer operations
pub type Result<T> = std::result::Result<T, ParallizerError>;
