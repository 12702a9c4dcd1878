//! Error types for the ingestion pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any state was touched
    #[error("Validation failed: {0}")]
    Validation(String),

    /// File type is not accepted by the target backend
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Requested chunk length range falls outside what the backend allows
    #[error(
        "Chunk length range [{min}, {max}] is outside the allowed range [{allowed_min}, {allowed_max}]"
    )]
    ChunkLengthOutOfRange {
        min: usize,
        max: usize,
        allowed_min: usize,
        allowed_max: usize,
    },

    /// The file already has a worker in flight for the requested stage
    #[error("{0}")]
    Conflict(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Permission collaborator refused the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Repository has no enabled files to search
    #[error("Repository {0} has no enabled content")]
    NoEnabledContent(i64),

    /// Every file in a batch failed to dispatch
    #[error("All files failed: {0}")]
    AllFailed(String),

    /// Extraction backend returned a failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Embedding error
    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Permission,
    Backend,
    Internal,
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a database error with context
    pub fn database(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Database(format!("{}: {}", context, err))
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::UnsupportedFileType(_)
            | Error::ChunkLengthOutOfRange { .. }
            | Error::NoEnabledContent(_)
            | Error::Config(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PermissionDenied(_) => ErrorKind::Permission,
            Error::Backend(_) | Error::Embedding(_) | Error::Http(_) | Error::AllFailed(_) => {
                ErrorKind::Backend
            }
            Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            Error::Config(_) => (StatusCode::BAD_REQUEST, "config_error"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            Error::UnsupportedFileType(_) => (StatusCode::BAD_REQUEST, "unsupported_type"),
            Error::ChunkLengthOutOfRange { .. } => (StatusCode::BAD_REQUEST, "chunk_length_out_of_range"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            Error::NoEnabledContent(_) => (StatusCode::UNPROCESSABLE_ENTITY, "no_enabled_content"),
            Error::AllFailed(_) => (StatusCode::BAD_GATEWAY, "all_failed"),
            Error::Backend(_) => (StatusCode::BAD_GATEWAY, "backend_error"),
            Error::Embedding(_) => (StatusCode::BAD_GATEWAY, "embedding_error"),
            Error::Http(_) => (StatusCode::BAD_GATEWAY, "http_error"),
            Error::Json(_) => (StatusCode::BAD_REQUEST, "json_error"),
            Error::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::conflict("busy").kind(), ErrorKind::Conflict);
        assert_eq!(
            Error::ChunkLengthOutOfRange { min: 8, max: 2000, allowed_min: 16, allowed_max: 1024 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::backend("code 1").kind(), ErrorKind::Backend);
        assert_eq!(Error::NoEnabledContent(3).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_response_status() {
        let resp = Error::conflict("splitting in progress").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = Error::NoEnabledContent(1).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
