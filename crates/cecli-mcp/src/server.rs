//! MCP server configuration.

use crate::error::McpResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// Transport used to reach an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout.
    #[default]
    Stdio,
    /// Legacy HTTP+SSE transport (GET event stream, POST messages).
    Sse,
    /// Streamable HTTP transport (POST with JSON or event-stream replies).
    #[serde(alias = "streamable-http", alias = "streamable_http", alias = "http-streaming")]
    Http,
    /// In-process tools; no connection at all.
    Local,
}

impl TransportKind {
    /// Whether this transport talks HTTP and therefore may need OAuth.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Sse | Self::Http)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
            Self::Local => "local",
        };
        f.write_str(s)
    }
}

/// Configuration for an MCP server.
///
/// Loaded once by the caller and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server name (unique identifier).
    #[serde(default = "default_name")]
    pub name: String,

    /// Transport kind.
    #[serde(default)]
    pub transport: TransportKind,

    /// Command for stdio transport.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Arguments for stdio transport.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment overlay for stdio transport.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// URL for HTTP transports.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Static headers for HTTP transports.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Whether the server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_name() -> String {
    "unnamed-server".to_string()
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    fn base(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            url: String::new(),
            headers: HashMap::new(),
            enabled: true,
        }
    }

    /// Create a stdio server configuration.
    pub fn stdio<S: Into<String>>(
        name: impl Into<String>,
        command: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Self {
        let mut config = Self::base(name, TransportKind::Stdio);
        config.command = command.into();
        config.args = args.into_iter().map(Into::into).collect();
        config
    }

    /// Create a legacy SSE server configuration.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::base(name, TransportKind::Sse);
        config.url = url.into();
        config
    }

    /// Create a streamable HTTP server configuration.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        let mut config = Self::base(name, TransportKind::Http);
        config.url = url.into();
        config
    }

    /// Create a local (in-process) server configuration.
    pub fn local(name: impl Into<String>) -> Self {
        Self::base(name, TransportKind::Local)
    }

    /// Add an environment variable (for stdio transport).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a header (for HTTP transports).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a static `Authorization` header is configured.
    pub fn has_static_authorization(&self) -> bool {
        self.headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("authorization"))
    }

    /// Check that the fields the transport needs are present.
    pub fn validate(&self) -> Result<(), String> {
        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => {
                Err(format!("stdio server '{}' has no command", self.name))
            }
            TransportKind::Sse | TransportKind::Http if self.url.trim().is_empty() => Err(
                format!("{} server '{}' has no url", self.transport, self.name),
            ),
            _ => Ok(()),
        }
    }
}

/// Parse a `{"mcpServers": {name: config, ...}}` document.
///
/// The map key becomes the server name. Entries without a `transport` field
/// use `default_transport`. Entries that fail to parse are skipped with a
/// warning; a document without `mcpServers` yields no servers.
pub fn parse_servers(json: &str, default_transport: TransportKind) -> McpResult<Vec<ServerConfig>> {
    let document: Value = serde_json::from_str(json)?;

    let Some(servers) = document.get("mcpServers").and_then(Value::as_object) else {
        warn!("No 'mcpServers' key found in MCP config");
        return Ok(Vec::new());
    };

    let mut configs = Vec::with_capacity(servers.len());
    for (name, raw) in servers {
        let mut raw = raw.clone();
        let Some(fields) = raw.as_object_mut() else {
            warn!(server = %name, "Skipping MCP server whose config is not an object");
            continue;
        };
        fields.insert("name".to_string(), Value::String(name.clone()));
        fields
            .entry("transport")
            .or_insert_with(|| Value::String(default_transport.to_string()));

        match serde_json::from_value::<ServerConfig>(raw) {
            Ok(config) => {
                debug!(server = %name, transport = %config.transport, "Loaded MCP server config");
                configs.push(config);
            }
            Err(e) => {
                warn!(server = %name, error = %e, "Skipping invalid MCP server config");
            }
        }
    }

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_config() {
        let config = ServerConfig::stdio("fs", "npx", ["-y", "server-filesystem"])
            .with_env("ROOT", "/tmp");
        assert_eq!(config.name, "fs");
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.args, vec!["-y", "server-filesystem"]);
        assert_eq!(config.env.get("ROOT"), Some(&"/tmp".to_string()));
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_config_headers() {
        let config = ServerConfig::http("remote", "https://example.com/mcp")
            .with_header("Authorization", "Bearer token");
        assert_eq!(config.transport, TransportKind::Http);
        assert!(config.has_static_authorization());
        assert!(config.transport.is_http());
    }

    #[test]
    fn test_validate_missing_fields() {
        assert!(ServerConfig::stdio("x", "", Vec::<String>::new())
            .validate()
            .is_err());
        assert!(ServerConfig::sse("x", "").validate().is_err());
        assert!(ServerConfig::local("x").validate().is_ok());
    }

    #[test]
    fn test_transport_aliases() {
        for alias in ["\"http\"", "\"streamable-http\"", "\"http-streaming\""] {
            let kind: TransportKind = serde_json::from_str(alias).unwrap();
            assert_eq!(kind, TransportKind::Http);
        }
        let kind: TransportKind = serde_json::from_str("\"sse\"").unwrap();
        assert_eq!(kind, TransportKind::Sse);
    }

    #[test]
    fn test_parse_servers() {
        let json = r#"{
            "mcpServers": {
                "git": {"command": "uvx", "args": ["mcp-server-git"], "env": {"A": "1"}},
                "remote": {"transport": "sse", "url": "https://example.com/sse", "enabled": false},
                "stream": {"transport": "http", "url": "https://example.com/mcp",
                           "headers": {"X-Key": "v"}}
            }
        }"#;

        let mut servers = parse_servers(json, TransportKind::Stdio).unwrap();
        servers.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].name, "git");
        assert_eq!(servers[0].transport, TransportKind::Stdio);
        assert_eq!(servers[0].command, "uvx");
        assert_eq!(servers[1].name, "remote");
        assert!(!servers[1].enabled);
        assert_eq!(servers[2].transport, TransportKind::Http);
        assert_eq!(servers[2].headers.get("X-Key"), Some(&"v".to_string()));
    }

    #[test]
    fn test_parse_servers_default_transport() {
        let json = r#"{"mcpServers": {"remote": {"url": "https://example.com/mcp"}}}"#;
        let servers = parse_servers(json, TransportKind::Http).unwrap();
        assert_eq!(servers[0].transport, TransportKind::Http);
    }

    #[test]
    fn test_parse_servers_missing_key() {
        let servers = parse_servers(r#"{"servers": {}}"#, TransportKind::Stdio).unwrap();
        assert!(servers.is_empty());
    }

    #[test]
    fn test_parse_servers_invalid_json() {
        assert!(parse_servers("{", TransportKind::Stdio).is_err());
    }

    #[test]
    fn test_parse_servers_skips_bad_entries() {
        let json = r#"{"mcpServers": {
            "bad": {"transport": "carrier-pigeon"},
            "good": {"command": "echo"}
        }}"#;
        let servers = parse_servers(json, TransportKind::Stdio).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "good");
    }
}
