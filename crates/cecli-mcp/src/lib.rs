//! MCP connection manager for cecli.
//!
//! Connects the coding agent to external Model Context Protocol servers,
//! keeps one live session per server, and caches the tools each server
//! exposes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    ┌──────────────┐    ┌───────────┐    ┌─────────────┐
//! │ McpServerManager │───▶│ ServerHandle │───▶│ McpSession│───▶│ MCP Servers │
//! │  (tool cache)    │    │ (cleanup)    │    │ Transport │◀───│   (tools)   │
//! └──────────────────┘    └──────────────┘    └───────────┘    └─────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: Local servers via stdin/stdout
//! - **SSE**: Remote servers via the legacy HTTP+SSE protocol
//! - **HTTP**: Remote servers via streamable HTTP
//! - **local**: In-process tools, no I/O
//!
//! Remote servers without a static `Authorization` header authenticate with
//! OAuth 2.1 (PKCE, loopback callback, dynamic client registration) on
//! their first 401; tokens persist through [`cecli_auth::TokenStore`].
//!
//! # Example
//!
//! ```no_run
//! use cecli_mcp::{ConnectionSettings, McpServerManager, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> cecli_mcp::McpResult<()> {
//! let settings = Arc::new(ConnectionSettings::from_home()?);
//! let manager = McpServerManager::from_configs(
//!     vec![ServerConfig::stdio(
//!         "filesystem",
//!         "npx",
//!         vec!["-y", "@modelcontextprotocol/server-filesystem"],
//!     )],
//!     settings,
//! );
//!
//! let outcome = manager.connect_all().await;
//! for (name, reason) in &outcome.failed {
//!     eprintln!("{name}: {reason}");
//! }
//!
//! let tools = manager.get_server_tools("filesystem").await;
//! println!("{} tools", tools.len());
//! manager.disconnect_all().await;
//! # Ok(())
//! # }
//! ```

mod auth_client;
pub mod callback;
mod cleanup;
mod error;
mod event_stream;
mod handle;
mod manager;
pub mod oauth;
pub mod pkce;
pub mod port;
pub mod protocol;
mod server;
mod session;
mod settings;
pub mod sse;
pub mod stdio;
pub mod streamable_http;
mod transport;

pub use auth_client::AuthClient;
pub use callback::{CallbackParams, OAuthCallbackServer, OAUTH_CALLBACK_PATH, OAUTH_CALLBACK_TIMEOUT};
pub use cleanup::CleanupStack;
pub use error::{McpError, McpResult};
pub use event_stream::{SseEvent, SseParser};
pub use handle::ServerHandle;
pub use manager::{BatchOutcome, McpServerManager};
pub use oauth::{AuthServerMetadata, OAuthProvider};
pub use pkce::{generate_pkce, PkcePair};
pub use port::{find_available_port, is_port_available};
pub use protocol::{McpTool, ToolCallResult, ToolContent};
pub use server::{parse_servers, ServerConfig, TransportKind};
pub use session::McpSession;
pub use settings::{
    AuthorizationPrompt, BrowserPrompt, ConnectionSettings, DEFAULT_CLIENT_NAME,
    DEFAULT_HTTP_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_STDERR_LOG,
};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;
pub use transport::Transport;
