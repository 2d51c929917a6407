//! Process-wide connection settings shared by every server handle.

use crate::callback::{OAUTH_CALLBACK_PATH, OAUTH_CALLBACK_TIMEOUT};
use crate::error::McpResult;
use crate::port::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use async_trait::async_trait;
use cecli_auth::TokenStore;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for a single JSON-RPC request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for HTTP requests made by the HTTP transports.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default file that stdio server stderr is appended to.
pub const DEFAULT_STDERR_LOG: &str = ".cecli/logs/mcp-errors.log";

/// Client name sent during dynamic client registration.
pub const DEFAULT_CLIENT_NAME: &str = "Cecli";

/// Presents an OAuth authorization URL to the user.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    /// Called once per browser flow, after the callback server is listening.
    async fn prompt(&self, server: &str, auth_url: &str) -> McpResult<()>;
}

/// Prints the URL to stderr and tries to open it in the default browser.
#[derive(Debug, Clone)]
pub struct BrowserPrompt {
    open_browser: bool,
}

impl BrowserPrompt {
    /// Print the URL and open the browser.
    pub fn new() -> Self {
        Self { open_browser: true }
    }

    /// Print the URL only.
    pub fn print_only() -> Self {
        Self {
            open_browser: false,
        }
    }
}

impl Default for BrowserPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationPrompt for BrowserPrompt {
    async fn prompt(&self, server: &str, auth_url: &str) -> McpResult<()> {
        info!(server = %server, "Authentication required for MCP server");
        eprintln!("\nAuthentication required for MCP server: {server}");
        eprintln!("\nPlease open this URL in your browser to authenticate:");
        eprintln!("\n{auth_url}\n");
        eprintln!("Waiting for you to complete authentication...");
        eprintln!("Use Control-C to interrupt.");

        if self.open_browser {
            let url = auth_url.to_string();
            // Browser launchers can block.
            let opened = tokio::task::spawn_blocking(move || open::that(url)).await;
            match opened {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Failed to open browser"),
                Err(e) => debug!(error = %e, "Browser task failed"),
            }
        }

        Ok(())
    }
}

/// Knobs shared by all server handles of one manager.
pub struct ConnectionSettings {
    /// Where OAuth tokens and client registrations are persisted.
    pub token_store: Arc<TokenStore>,
    /// File stdio server stderr is appended to.
    pub stderr_log: PathBuf,
    /// Timeout for one JSON-RPC request.
    pub request_timeout: Duration,
    /// Timeout for one HTTP request.
    pub http_timeout: Duration,
    /// First port probed for the OAuth callback server.
    pub callback_port_start: u16,
    /// Last port probed for the OAuth callback server.
    pub callback_port_end: u16,
    /// Path the callback server answers.
    pub callback_path: String,
    /// How long to wait for the browser redirect.
    pub callback_timeout: Duration,
    /// Client name used for dynamic registration.
    pub client_name: String,
    /// How the authorization URL reaches the user.
    pub prompt: Arc<dyn AuthorizationPrompt>,
}

impl ConnectionSettings {
    /// Settings with defaults around the given token store.
    pub fn new(token_store: TokenStore) -> Self {
        Self {
            token_store: Arc::new(token_store),
            stderr_log: PathBuf::from(DEFAULT_STDERR_LOG),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            callback_port_start: DEFAULT_PORT_RANGE_START,
            callback_port_end: DEFAULT_PORT_RANGE_END,
            callback_path: OAUTH_CALLBACK_PATH.to_string(),
            callback_timeout: OAUTH_CALLBACK_TIMEOUT,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            prompt: Arc::new(BrowserPrompt::new()),
        }
    }

    /// Settings with defaults, persisting tokens under the home directory.
    pub fn from_home() -> McpResult<Self> {
        Ok(Self::new(TokenStore::new(TokenStore::default_path()?)))
    }

    /// Set the stderr log file for stdio servers.
    pub fn with_stderr_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr_log = path.into();
        self
    }

    /// Set the JSON-RPC request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the HTTP client timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the port range probed for the callback server.
    pub fn with_callback_ports(mut self, start: u16, end: u16) -> Self {
        self.callback_port_start = start;
        self.callback_port_end = end;
        self
    }

    /// Set how long to wait for the browser redirect.
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Set how the authorization URL is presented.
    pub fn with_prompt(mut self, prompt: Arc<dyn AuthorizationPrompt>) -> Self {
        self.prompt = prompt;
        self
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("token_store", &self.token_store)
            .field("stderr_log", &self.stderr_log)
            .field("request_timeout", &self.request_timeout)
            .field("http_timeout", &self.http_timeout)
            .field(
                "callback_ports",
                &format_args!("{}-{}", self.callback_port_start, self.callback_port_end),
            )
            .field("callback_path", &self.callback_path)
            .field("callback_timeout", &self.callback_timeout)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}
