//! MCP error types.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Process spawn or handshake failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake succeeded but the tool enumeration did not.
    #[error("Tool listing failed: {0}")]
    ToolListingFailed(String),

    /// Server process failed.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    ToolError(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request timeout.
    #[error("Server timeout")]
    Timeout,

    /// Server returned 401 and no OAuth provider could recover.
    #[error("Authentication required")]
    AuthRequired,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// No OAuth callback arrived in time.
    #[error("OAuth callback timed out after {0} seconds")]
    OAuthTimeout(u64),

    /// The authorization server redirected back with an error.
    #[error("OAuth error: {0}")]
    OAuthServerError(String),

    /// No bindable port for the OAuth callback server.
    #[error("Could not find available port for OAuth callback in {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    /// Tokens could not be written to disk.
    #[error("Failed to save OAuth tokens: {0}")]
    TokenPersistence(#[from] cecli_auth::AuthError),

    /// The operation was cancelled or its task was torn down.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a tool error.
    pub fn tool_error(message: impl Into<String>) -> Self {
        Self::ToolError(message.into())
    }

    /// Whether this error only means the resource was already torn down.
    ///
    /// Teardown treats these as "already cleaned up" rather than failures.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for McpError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled(e.to_string())
        } else {
            Self::ProcessError(format!("Task panicked: {e}"))
        }
    }
}
