use thiserror::Error;

use crate::core::{ErrorKind, QueryError};

/// Startup and configuration errors.
///
/// Per-query failures never use this type: they travel inside
/// [`QueryResult::error`](crate::core::QueryResult) so a response layer can
/// render them.
#[derive(Error, Debug)]
pub enum QueryEngineError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP client errors
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend could not be reached at startup
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },
}

impl From<String> for QueryEngineError {
    fn from(s: String) -> Self {
        QueryEngineError::Config(s)
    }
}

impl From<&str> for QueryEngineError {
    fn from(s: &str) -> Self {
        QueryEngineError::Config(s.to_string())
    }
}

/// Cache store failures.
///
/// Always absorbed by the executor: a failing cache behaves like an empty one.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Errors reported by a [`QueryBackend`](crate::backends::QueryBackend).
///
/// Each backend maps its native failures onto these variants so nothing
/// backend-specific leaks into [`QueryResult`](crate::core::QueryResult).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Unknown(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::BadRequest(_) => ErrorKind::BadRequest,
            BackendError::AccessDenied(_) => ErrorKind::AccessDenied,
            BackendError::NotFound(_) => ErrorKind::NotFound,
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::BadRequest(m)
            | BackendError::AccessDenied(m)
            | BackendError::NotFound(m)
            | BackendError::Timeout(m)
            | BackendError::Unknown(m) => m,
        }
    }
}

impl From<BackendError> for QueryError {
    fn from(err: BackendError) -> Self {
        QueryError::new(err.kind(), err.message())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, QueryEngineError>;
