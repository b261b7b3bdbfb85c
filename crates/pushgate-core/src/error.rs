//! Error taxonomy for publishing and reading packages, with HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result alias used across the core.
pub type Result<T> = std::result::Result<T, PushError>;

/// Errors raised by the gallery core.
#[derive(Error, Debug)]
pub enum PushError {
    /// The identity was already claimed by an earlier (or concurrent) push.
    #[error("Conflict: package {id} {version} already exists")]
    IdentityConflict { id: String, version: String },

    /// Malformed archive, bad identity, or asserted/embedded identity mismatch.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Upload exceeded the configured size limit.
    #[error("Package exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// The client stream ended with an error before completing.
    #[error("Upload aborted: {0}")]
    UploadAborted(String),

    /// The identity was claimed but its artifact could not be persisted.
    /// The claim is permanent, so the identity is burned.
    #[error("Store write failed for {identity}: {reason}")]
    StoreWriteFailure { identity: String, reason: String },

    /// Post-admission validation rejected the artifact.
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// A terminal validation state cannot be changed.
    #[error("Validation state for {0} is already terminal")]
    AlreadyTerminal(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client side: the server could not be reached or answered garbage.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PushError {
    /// Stable machine-readable code, also used as the `code` field of HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PushError::IdentityConflict { .. } => "IDENTITY_CONFLICT",
            PushError::InvalidPayload(_) => "INVALID_PAYLOAD",
            PushError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            PushError::UploadAborted(_) => "UPLOAD_ABORTED",
            PushError::StoreWriteFailure { .. } => "STORE_WRITE_FAILURE",
            PushError::ValidationFailure(_) => "VALIDATION_FAILURE",
            PushError::AlreadyTerminal(_) => "ALREADY_TERMINAL",
            PushError::Unauthorized(_) => "UNAUTHORIZED",
            PushError::NotFound(_) => "NOT_FOUND",
            PushError::Config(_) => "CONFIG_ERROR",
            PushError::Io(_) => "IO_ERROR",
            PushError::Json(_) => "JSON_ERROR",
            PushError::Transport(_) => "TRANSPORT_ERROR",
            PushError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PushError::IdentityConflict { .. } => StatusCode::CONFLICT,
            PushError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            PushError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PushError::UploadAborted(_) => StatusCode::BAD_REQUEST,
            PushError::ValidationFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PushError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PushError::NotFound(_) => StatusCode::NOT_FOUND,
            PushError::Json(_) => StatusCode::BAD_REQUEST,
            PushError::Transport(_) => StatusCode::BAD_GATEWAY,
            PushError::StoreWriteFailure { .. }
            | PushError::AlreadyTerminal(_)
            | PushError::Config(_)
            | PushError::Io(_)
            | PushError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-side errors that the server never retries on its own.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match &self {
            PushError::Io(_) => "IO operation failed".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request error");
        } else {
            tracing::debug!(error = %self, code, "Request rejected");
        }

        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}
