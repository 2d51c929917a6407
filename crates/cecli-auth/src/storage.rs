//! Token store implementation.

use crate::error::{AuthError, AuthResult};
use crate::{CONFIG_DIR_NAME, TOKEN_FILE_NAME};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// OAuth tokens issued to one MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds as reported by the token endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredTokens {
    /// Create a bearer token record with only an access token.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            refresh_token: None,
            expires_in: None,
            scope: None,
        }
    }
}

/// Client registration metadata for one MCP server.
///
/// Fields the registration endpoint returns beyond the ones named here are
/// kept in `extra` so that a rewrite does not lose them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    /// Unix timestamp; `0` or absent means the secret never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoredClientInfo {
    /// Create client info for a public client with a single redirect URI.
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uris: vec![redirect_uri.into()],
            token_endpoint: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
            extra: Map::new(),
        }
    }

    /// The redirect URI the client was registered with, if any.
    pub fn redirect_uri(&self) -> Option<&str> {
        self.redirect_uris.first().map(String::as_str)
    }

    /// Check whether the client secret has expired at `now` (Unix seconds).
    pub fn secret_expired(&self, now: u64) -> bool {
        match self.client_secret_expires_at {
            Some(0) | None => false,
            Some(expires_at) => expires_at < now,
        }
    }
}

/// Everything persisted for one MCP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<StoredTokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<StoredClientInfo>,
}

/// File-backed store of OAuth records keyed by MCP server name.
///
/// Every access reads the file; every update rewrites it whole. The store
/// keeps no in-memory cache so two handles on the same path never disagree.
/// Updates through one store are serialized; separate processes are not.
pub struct TokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Create a token store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Default location: `~/.cecli/mcp-oauth-tokens.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn default_path() -> AuthResult<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_DIR_NAME).join(TOKEN_FILE_NAME))
            .ok_or(AuthError::NoHomeDir)
    }

    /// Get the path to the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the full record for a server, if one is stored.
    pub async fn get_record(&self, server: &str) -> Option<OAuthRecord> {
        let raw = self.read_raw().await;
        let value = raw.get(server)?.clone();
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(server = %server, error = %e, "Ignoring invalid OAuth record");
                None
            }
        }
    }

    /// Get stored tokens for a server.
    pub async fn get_tokens(&self, server: &str) -> Option<StoredTokens> {
        self.get_record(server).await.and_then(|r| r.tokens)
    }

    /// Get stored client registration for a server.
    pub async fn get_client_info(&self, server: &str) -> Option<StoredClientInfo> {
        self.get_record(server).await.and_then(|r| r.client_info)
    }

    /// Store tokens for a server, keeping its client registration.
    pub async fn set_tokens(&self, server: &str, tokens: StoredTokens) -> AuthResult<()> {
        debug!(server = %server, "Saving OAuth tokens");
        self.update_field(server, "tokens", serde_json::to_value(tokens)?)
            .await
    }

    /// Store client registration for a server, keeping its tokens.
    pub async fn set_client_info(&self, server: &str, info: StoredClientInfo) -> AuthResult<()> {
        debug!(server = %server, client_id = %info.client_id, "Saving OAuth client info");
        self.update_field(server, "client_info", serde_json::to_value(info)?)
            .await
    }

    /// Replace the full record for a server.
    pub async fn set_record(&self, server: &str, record: OAuthRecord) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.read_raw().await;
        raw.insert(server.to_string(), serde_json::to_value(record)?);
        self.write_raw(&raw).await
    }

    /// Get all records that parse.
    pub async fn all(&self) -> HashMap<String, OAuthRecord> {
        let mut result = HashMap::new();
        for (key, value) in self.read_raw().await {
            match serde_json::from_value::<OAuthRecord>(value) {
                Ok(record) => {
                    result.insert(key, record);
                }
                Err(e) => {
                    warn!(server = %key, error = %e, "Skipping invalid OAuth record");
                }
            }
        }
        result
    }

    /// Read-modify-write one top-level field of one server's entry.
    async fn update_field(&self, server: &str, field: &str, value: Value) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut raw = self.read_raw().await;
        let entry = raw
            .entry(server.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(field.to_string(), value);
        }
        self.write_raw(&raw).await
    }

    /// Read the whole file. Missing, empty, or corrupt files read as empty.
    async fn read_raw(&self) -> Map<String, Value> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?self.path, error = %e, "Failed to read token file");
                }
                return Map::new();
            }
        };

        if content.trim().is_empty() {
            return Map::new();
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = ?self.path, "Token file is not a JSON object");
                Map::new()
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Token file is corrupt");
                Map::new()
            }
        }
    }

    /// Rewrite the whole file through an owner-only temp file.
    ///
    /// The temp file is created with mode 0600 and renamed over the token
    /// file, so the tokens are never readable by other users.
    async fn write_raw(&self, data: &Map<String, Value>) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        let temp = self.temp_path();

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&temp).await?;

        #[cfg(unix)]
        {
            // A stale temp file keeps its old mode.
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            file.set_permissions(perms).await.map_err(|e| {
                AuthError::Permissions(format!(
                    "Failed to set permissions on {:?}: {}",
                    temp, e
                ))
            })?;
        }

        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await?;
        debug!(path = ?self.path, "Wrote token file");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("path", &self.path)
            .finish()
    }
}
