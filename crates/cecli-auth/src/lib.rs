//! OAuth token storage for cecli MCP servers.
//!
//! HTTP-based MCP servers authenticate with OAuth 2.0. The tokens they are
//! issued, together with the dynamically registered client, are kept in a
//! single JSON document keyed by server name so that a later run can reuse
//! both the client registration and its redirect port.
//!
//! # Storage Location
//!
//! `~/.cecli/mcp-oauth-tokens.json`, rewritten in full on every update and
//! forced to `0600` on Unix.
//!
//! # Example
//!
//! ```no_run
//! use cecli_auth::{StoredTokens, TokenStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = TokenStore::new(TokenStore::default_path()?);
//!
//!     store
//!         .set_tokens("github", StoredTokens::bearer("gho_..."))
//!         .await?;
//!
//!     if let Some(tokens) = store.get_tokens("github").await {
//!         println!("token type: {}", tokens.token_type);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod error;
mod storage;

pub use error::{AuthError, AuthResult};
pub use storage::{OAuthRecord, StoredClientInfo, StoredTokens, TokenStore};

/// Directory under the user's home that holds cecli state.
pub const CONFIG_DIR_NAME: &str = ".cecli";

/// File name of the MCP OAuth token store.
pub const TOKEN_FILE_NAME: &str = "mcp-oauth-tokens.json";

/// Get the current time in seconds since Unix epoch.
pub fn current_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
