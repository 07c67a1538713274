//! Error types for polarway-stream: Railway Programming
//!
//! All operations return `Result<T, StreamError>`.
//! The variants mirror how a caller is expected to react: `NotFound` means
//! "no data for this partition", `Transient` is the only retryable class,
//! and `DecodeFailure` / `BackendUnavailable` degrade to empty results.

use thiserror::Error;

/// Unified error type for all streaming operations
#[derive(Error, Debug)]
pub enum StreamError {
    // ─── Input Errors ───

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ─── Storage Errors ───

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied for {path}: {message}")]
    PermissionDenied { path: String, message: String },

    #[error("Transient storage error: {0}")]
    Transient(String),

    // ─── Decode Errors ───

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("No decoder backend available: {0}")]
    BackendUnavailable(String),

    // ─── Infrastructure Errors ───

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Only transient storage failures are worth retrying, and never inside the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StreamError::PermissionDenied { .. })
    }
}

impl From<object_store::Error> for StreamError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StreamError::NotFound(path),
            object_store::Error::PermissionDenied { path, source }
            | object_store::Error::Unauthenticated { path, source } => {
                StreamError::PermissionDenied {
                    path,
                    message: source.to_string(),
                }
            }
            other => StreamError::Transient(other.to_string()),
        }
    }
}

impl From<object_store::path::Error> for StreamError {
    fn from(err: object_store::path::Error) -> Self {
        StreamError::InvalidArgument(format!("invalid object path: {err}"))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<polars::prelude::PolarsError> for StreamError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        StreamError::DecodeFailure(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for StreamError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        StreamError::DecodeFailure(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(err: tokio::task::JoinError) -> Self {
        StreamError::Internal(format!("background task failed: {err}"))
    }
}

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, StreamError>;
