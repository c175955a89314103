//! Error types for teamsync.
//!
//! Remote failures carry the HTTP status when one is available so that the
//! presentation layer can tell an authentication problem from a server fault.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the teamsync library.
#[derive(Debug, Error)]
pub enum SyncError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("{endpoint} timed out after {after:?}")]
    Timeout {
        endpoint: String,
        after: std::time::Duration,
    },

    #[error("{endpoint} returned HTTP {status}: {message}")]
    Http {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("Connection to {address} failed: {message}")]
    Connection { address: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Pipeline errors
    #[error("Bad image data in dataset {dataset}: {message}")]
    DataIntegrity { dataset: String, message: String },

    #[error("Annotation does not match project meta: {message}")]
    SchemaMismatch { message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for teamsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                endpoint: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_default(),
                message: err.to_string(),
            }
        } else {
            SyncError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl SyncError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a validation error for a named input field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Errors caused by user input that should be shown as a retryable
    /// message instead of aborting the session.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            SyncError::Connection { .. } | SyncError::Validation { .. }
        )
    }

    /// Check if the remote side rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::Http { status: 401 | 403, .. })
    }
}
