//! Per-server connection lifecycle.

use crate::auth_client::AuthClient;
use crate::cleanup::CleanupStack;
use crate::error::{McpError, McpResult};
use crate::protocol::McpTool;
use crate::server::{ServerConfig, TransportKind};
use crate::session::McpSession;
use crate::settings::ConnectionSettings;
use crate::sse::SseTransport;
use crate::stdio::StdioTransport;
use crate::streamable_http::StreamableHttpTransport;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Owns one server's session and everything acquired to establish it.
///
/// Connect and disconnect are serialized by the cleanup lock, so concurrent
/// connects never spawn a second process.
pub struct ServerHandle {
    config: ServerConfig,
    settings: Arc<ConnectionSettings>,
    local_tools: Vec<McpTool>,
    cleanup: Mutex<CleanupStack>,
    session: RwLock<Option<Arc<McpSession>>>,
}

impl ServerHandle {
    pub fn new(config: ServerConfig, settings: Arc<ConnectionSettings>) -> Self {
        Self {
            config,
            settings,
            local_tools: Vec::new(),
            cleanup: Mutex::new(CleanupStack::new()),
            session: RwLock::new(None),
        }
    }

    /// Handle for an in-process server exposing `tools`.
    pub fn local(
        name: impl Into<String>,
        tools: Vec<McpTool>,
        settings: Arc<ConnectionSettings>,
    ) -> Self {
        let mut handle = Self::new(ServerConfig::local(name), settings);
        handle.local_tools = tools;
        handle
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub async fn session(&self) -> Option<Arc<McpSession>> {
        self.session.read().await.clone()
    }

    /// Establish the session, or return the live one.
    ///
    /// Disabled servers yield `Ok(None)` and touch nothing. On failure every
    /// resource acquired so far is released before the error is returned.
    pub async fn connect(&self) -> McpResult<Option<Arc<McpSession>>> {
        if !self.config.enabled {
            debug!(server = %self.config.name, "Server is disabled, skipping");
            return Ok(None);
        }

        let mut cleanup = self.cleanup.lock().await;
        if let Some(session) = self.session.read().await.clone() {
            return Ok(Some(session));
        }

        info!(server = %self.config.name, transport = %self.config.transport, "Connecting to MCP server");
        match self.open(&mut cleanup).await {
            Ok(session) => {
                *self.session.write().await = Some(session.clone());
                Ok(Some(session))
            }
            Err(e) => {
                error!(server = %self.config.name, error = %e, "Failed to connect to MCP server");
                cleanup.unwind().await;
                Err(e)
            }
        }
    }

    async fn open(&self, cleanup: &mut CleanupStack) -> McpResult<Arc<McpSession>> {
        self.config
            .validate()
            .map_err(McpError::ConnectionFailed)?;

        let name = &self.config.name;
        let settings = &self.settings;
        let transport: Arc<dyn Transport> = match self.config.transport {
            TransportKind::Local => {
                return Ok(Arc::new(McpSession::local(
                    name.clone(),
                    self.local_tools.clone(),
                )));
            }
            TransportKind::Stdio => Arc::new(
                StdioTransport::spawn(&self.config, &settings.stderr_log, settings.request_timeout)
                    .await?,
            ),
            TransportKind::Sse => {
                let client = Arc::new(AuthClient::new(&self.config, settings)?);
                Arc::new(
                    SseTransport::connect(
                        name.clone(),
                        &self.config.url,
                        client,
                        settings.request_timeout,
                    )
                    .await?,
                )
            }
            TransportKind::Http => {
                let client = Arc::new(AuthClient::new(&self.config, settings)?);
                Arc::new(StreamableHttpTransport::new(
                    name.clone(),
                    self.config.url.clone(),
                    client,
                    settings.request_timeout,
                ))
            }
        };

        let closing = transport.clone();
        cleanup.push(format!("{name} transport"), move || async move {
            closing.close().await
        });

        let session = McpSession::initialize(name.clone(), transport).await?;
        Ok(Arc::new(session))
    }

    /// Release the session and everything acquired with it.
    ///
    /// Never fails; a no-op when not connected.
    pub async fn disconnect(&self) {
        let mut cleanup = self.cleanup.lock().await;
        let session = self.session.write().await.take();
        cleanup.unwind().await;
        if session.is_some() {
            info!(server = %self.config.name, "Disconnected from MCP server");
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.config.name)
            .field("transport", &self.config.transport)
            .field("enabled", &self.config.enabled)
            .finish_non_exhaustive()
    }
}
