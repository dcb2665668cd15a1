use crate::services::{delivery::DeliveryError, ingest::IngestError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        tracing::error!(error = %err, "upload failed");
        AppError::internal("Upload failed.")
    }
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        let status = match &err {
            DeliveryError::InvalidReference => StatusCode::BAD_REQUEST,
            DeliveryError::InvalidOrExpired => StatusCode::GONE,
            DeliveryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DeliveryError::Catalog(inner) => {
                tracing::error!(error = %inner, "catalog failure during redemption");
                return AppError::internal("Error downloading file.");
            }
        };
        AppError::new(status, err.to_string())
    }
}
