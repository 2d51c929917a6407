//! Error types for token storage operations.

use thiserror::Error;

/// Errors that can occur while persisting OAuth records.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the token file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize the token file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not determine the home directory.
    #[error("Could not determine home directory")]
    NoHomeDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

/// Result type for token storage operations.
pub type AuthResult<T> = Result<T, AuthError>;
