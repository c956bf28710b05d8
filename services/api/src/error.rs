//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how each
//! error is reported to HTTP clients.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::error;
use tutor_core::{EngineError, PortError};

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents a rejected or failed learning-session operation.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a failure to apply the embedded migrations.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A request the client got wrong before it reached the engine.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// The JSON body of every error response.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl ErrorBody {
    pub fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_string(),
            message,
            retryable: false,
            remaining: None,
            limit: None,
        }
    }
}

/// Maps an engine error to its status code and body.
pub fn engine_error_parts(err: &EngineError) -> (StatusCode, ErrorBody) {
    let message = err.to_string();
    match err {
        EngineError::StructureNotReady(_) => (
            StatusCode::CONFLICT,
            ErrorBody::new("structure_not_ready", message),
        ),
        EngineError::QuotaExceeded {
            remaining, limit, ..
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            ErrorBody {
                remaining: Some(*remaining),
                limit: Some(*limit),
                ..ErrorBody::new("quota_exceeded", message)
            },
        ),
        EngineError::InvalidAnswer(_) => (
            StatusCode::BAD_REQUEST,
            ErrorBody::new("invalid_answer", message),
        ),
        EngineError::InvalidTransition(_) => (
            StatusCode::CONFLICT,
            ErrorBody::new("invalid_transition", message),
        ),
        EngineError::GenerationFailed(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody {
                retryable: true,
                ..ErrorBody::new("generation_failed", message)
            },
        ),
        EngineError::GenerationTimeout(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            ErrorBody {
                retryable: true,
                ..ErrorBody::new("generation_timeout", message)
            },
        ),
        EngineError::SessionNotFound(_) => (
            StatusCode::NOT_FOUND,
            ErrorBody::new("session_not_found", message),
        ),
        EngineError::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorBody::new("forbidden", message)),
        EngineError::Port(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new("internal", "An internal error occurred".to_string()),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Engine(err) => engine_error_parts(err),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("bad_request", message.clone()),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("internal", "An internal error occurred".to_string()),
            ),
        };
        if status.is_server_error() {
            error!("Request failed: {:?}", self);
        }
        (status, Json(body)).into_response()
    }
}
