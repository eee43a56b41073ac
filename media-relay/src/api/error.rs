//! Mapping from domain errors to JSON error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// JSON body of every non-2xx response.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Stable machine-readable code, e.g. `INVALID_RESOURCE`.
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_RESOURCE", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidResource(msg) => ApiError::invalid_resource(msg),
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{entity_type} with id '{id}' not found"))
            }
            Error::Conflict { id } => ApiError::conflict(format!("Download {id} is already active"))
                .with_details(serde_json::json!({ "id": id })),
            Error::InvalidStateTransition { from, to } => {
                ApiError::conflict(format!("Cannot transition from {from} to {to}"))
                    .with_details(serde_json::json!({ "from": from, "to": to }))
            }
            Error::Upstream(msg) => {
                tracing::warn!(error = %msg, "Media provider failed");
                ApiError::upstream(msg)
            }
            Error::Process(msg) => {
                tracing::error!(error = %msg, "Pipeline failed before streaming");
                ApiError::internal(format!("Processing failed: {msg}"))
            }
            Error::Configuration(msg) => ApiError::bad_request(msg),
            Error::Io(_) | Error::IoPath { .. } => {
                tracing::error!(error = %err, "Storage failure");
                ApiError::internal("Storage failure")
            }
            _ => {
                tracing::error!(error = %err, "Unhandled error");
                ApiError::internal(err.to_string())
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
