//! Connection manager for every configured MCP server.

use crate::error::{McpError, McpResult};
use crate::handle::ServerHandle;
use crate::protocol::{McpTool, ToolCallResult};
use crate::server::ServerConfig;
use crate::session::McpSession;
use crate::settings::ConnectionSettings;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of a batch connect or disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    /// Server name and the reason it failed.
    pub failed: Vec<(String, String)>,
}

/// Connected servers and their tools, always updated together.
#[derive(Debug, Default)]
struct Registry {
    connected: Vec<String>,
    tools: HashMap<String, Vec<McpTool>>,
}

impl Registry {
    fn insert(&mut self, name: &str, tools: Vec<McpTool>) {
        if !self.connected.iter().any(|n| n == name) {
            self.connected.push(name.to_string());
        }
        self.tools.insert(name.to_string(), tools);
    }

    fn remove(&mut self, name: &str) {
        self.connected.retain(|n| n != name);
        self.tools.remove(name);
    }

    fn contains(&self, name: &str) -> bool {
        self.connected.iter().any(|n| n == name)
    }
}

/// Owns one [`ServerHandle`] per configured server.
///
/// A server counts as connected only once both its session and its tool
/// listing succeeded.
pub struct McpServerManager {
    handles: RwLock<Vec<Arc<ServerHandle>>>,
    registry: RwLock<Registry>,
}

impl McpServerManager {
    /// Create a manager; later handles with an already-used name are dropped.
    pub fn new(handles: impl IntoIterator<Item = ServerHandle>) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for handle in handles {
            if !seen.insert(handle.name().to_string()) {
                warn!(server = %handle.name(), "Duplicate MCP server name, ignoring");
                continue;
            }
            unique.push(Arc::new(handle));
        }

        Self {
            handles: RwLock::new(unique),
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Create a manager with one handle per config.
    pub fn from_configs(
        configs: impl IntoIterator<Item = ServerConfig>,
        settings: Arc<ConnectionSettings>,
    ) -> Self {
        Self::new(
            configs
                .into_iter()
                .map(|config| ServerHandle::new(config, settings.clone())),
        )
    }

    /// Connect every enabled server that is not yet connected, concurrently.
    ///
    /// Failures are logged and reported in the outcome, never raised.
    pub async fn connect_all(&self) -> BatchOutcome {
        let mut candidates = Vec::new();
        {
            let registry = self.registry.read().await;
            for handle in self.handles.read().await.iter() {
                if handle.is_enabled() && !registry.contains(handle.name()) {
                    candidates.push(handle.clone());
                }
            }
        }

        if candidates.is_empty() {
            debug!("No MCP servers to connect");
            return BatchOutcome::default();
        }

        let results = join_all(candidates.iter().map(|h| self.connect_handle(h))).await;

        let mut outcome = BatchOutcome::default();
        for (handle, result) in candidates.iter().zip(results) {
            match result {
                Ok(()) => outcome.succeeded.push(handle.name().to_string()),
                Err(e) => outcome
                    .failed
                    .push((handle.name().to_string(), e.to_string())),
            }
        }

        info!(
            connected = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "MCP servers connected"
        );
        outcome
    }

    /// Connect and list tools; the server is recorded only if both succeed.
    async fn connect_handle(&self, handle: &ServerHandle) -> McpResult<()> {
        let name = handle.name();
        let session = handle.connect().await?.ok_or_else(|| {
            McpError::connection_failed(format!("MCP server '{name}' is disabled"))
        })?;

        match session.list_tools().await {
            Ok(tools) => self.record_connected(handle, &session, tools).await,
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to list MCP tools");
                handle.disconnect().await;
                Err(e)
            }
        }
    }

    /// Record `tools` for `handle` if `session` is still its live session.
    ///
    /// Checked under the registry lock so a disconnect that raced the tool
    /// listing cannot leave a stale entry behind.
    async fn record_connected(
        &self,
        handle: &ServerHandle,
        session: &Arc<McpSession>,
        tools: Vec<McpTool>,
    ) -> McpResult<()> {
        let name = handle.name();
        let mut registry = self.registry.write().await;
        let live = handle
            .session()
            .await
            .is_some_and(|current| Arc::ptr_eq(&current, session));
        if !live {
            debug!(server = %name, "MCP server disconnected while listing tools");
            return Err(McpError::connection_failed(format!(
                "MCP server '{name}' was disconnected while connecting"
            )));
        }

        info!(server = %name, tool_count = tools.len(), "Connected to MCP server");
        registry.insert(name, tools);
        Ok(())
    }

    /// Disconnect every connected server, concurrently.
    pub async fn disconnect_all(&self) -> BatchOutcome {
        let connected = self.registry.read().await.connected.clone();
        if connected.is_empty() {
            debug!("MCP servers already disconnected");
            return BatchOutcome::default();
        }

        let mut handles = Vec::new();
        for name in &connected {
            if let Some(handle) = self.get_server(name).await {
                handles.push(handle);
            }
        }

        join_all(handles.iter().map(|h| h.disconnect())).await;

        let mut registry = self.registry.write().await;
        for name in &connected {
            registry.remove(name);
        }

        info!(count = connected.len(), "Disconnected from all MCP servers");
        BatchOutcome {
            succeeded: connected,
            failed: Vec::new(),
        }
    }

    /// Connect one server by name. Returns `false` on unknown names and
    /// failed connects.
    pub async fn connect_server(&self, name: &str) -> bool {
        let Some(handle) = self.get_server(name).await else {
            warn!(server = %name, "MCP server not found");
            return false;
        };

        if self.registry.read().await.contains(name) {
            debug!(server = %name, "MCP server already connected");
            return true;
        }

        self.connect_handle(&handle).await.is_ok()
    }

    /// Disconnect one server by name. Returns `false` only on unknown names.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let Some(handle) = self.get_server(name).await else {
            warn!(server = %name, "MCP server not found");
            return false;
        };

        handle.disconnect().await;
        self.registry.write().await.remove(name);
        true
    }

    pub async fn get_server(&self, name: &str) -> Option<Arc<ServerHandle>> {
        self.handles
            .read()
            .await
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Register a new handle, optionally connecting it straight away.
    ///
    /// Returns `false` for a duplicate name, or when `auto_connect` is set and
    /// the connect fails.
    pub async fn add_server(&self, handle: ServerHandle, auto_connect: bool) -> bool {
        let name = handle.name().to_string();
        {
            let mut handles = self.handles.write().await;
            if handles.iter().any(|h| h.name() == name) {
                warn!(server = %name, "MCP server already exists");
                return false;
            }
            handles.push(Arc::new(handle));
        }
        debug!(server = %name, "Added MCP server");

        if auto_connect {
            return self.connect_server(&name).await;
        }
        true
    }

    /// Cached tools of one server; empty when it is not connected.
    pub async fn get_server_tools(&self, name: &str) -> Vec<McpTool> {
        self.registry
            .read()
            .await
            .tools
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Cached tools keyed by server name.
    pub async fn all_tools(&self) -> HashMap<String, Vec<McpTool>> {
        self.registry.read().await.tools.clone()
    }

    pub async fn connected_servers(&self) -> Vec<Arc<ServerHandle>> {
        let registry = self.registry.read().await;
        self.handles
            .read()
            .await
            .iter()
            .filter(|h| registry.contains(h.name()))
            .cloned()
            .collect()
    }

    /// Every managed server that is not connected, disabled ones included.
    pub async fn failed_servers(&self) -> Vec<Arc<ServerHandle>> {
        let registry = self.registry.read().await;
        self.handles
            .read()
            .await
            .iter()
            .filter(|h| !registry.contains(h.name()))
            .cloned()
            .collect()
    }

    pub async fn servers(&self) -> Vec<Arc<ServerHandle>> {
        self.handles.read().await.clone()
    }

    /// Whether any server is connected.
    pub async fn is_connected(&self) -> bool {
        !self.registry.read().await.connected.is_empty()
    }

    /// Invoke `tool` on the named server's live session.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> McpResult<ToolCallResult> {
        let handle = self
            .get_server(server)
            .await
            .ok_or_else(|| McpError::ServerNotFound(server.to_string()))?;

        let session = handle.session().await.ok_or_else(|| {
            McpError::connection_failed(format!("MCP server '{server}' is not connected"))
        })?;

        session.call_tool(tool, arguments).await
    }
}

impl std::fmt::Debug for McpServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerManager").finish_non_exhaustive()
    }
}
