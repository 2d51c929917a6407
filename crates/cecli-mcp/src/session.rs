//! An initialized MCP session.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    ListToolsResult, McpTool, ServerInfo, ToolCallResult,
};
use crate::transport::Transport;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A live session with one MCP server.
///
/// Local sessions have no transport; they serve the tool schemas they were
/// created with.
pub struct McpSession {
    server_name: String,
    transport: Option<Arc<dyn Transport>>,
    server_info: Option<InitializeResult>,
    local_tools: Vec<McpTool>,
    next_id: AtomicU64,
}

impl McpSession {
    /// Sentinel session for an in-process server.
    pub fn local(server_name: impl Into<String>, tools: Vec<McpTool>) -> Self {
        Self {
            server_name: server_name.into(),
            transport: None,
            server_info: None,
            local_tools: tools,
            next_id: AtomicU64::new(1),
        }
    }

    /// Run the `initialize` handshake over `transport`.
    pub async fn initialize(
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> McpResult<Self> {
        let mut session = Self {
            server_name: server_name.into(),
            transport: Some(transport.clone()),
            server_info: None,
            local_tools: Vec::new(),
            next_id: AtomicU64::new(1),
        };

        let params = serde_json::to_value(InitializeParams::default())?;
        let request = JsonRpcRequest::new(session.next_request_id(), "initialize", Some(params));
        let response = transport.request(request).await?;

        if let Some(error) = response.error {
            return Err(McpError::connection_failed(format!(
                "Initialization of '{}' failed: {}",
                session.server_name, error.message
            )));
        }

        let result: InitializeResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing initialize result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))?;

        debug!(
            server = %session.server_name,
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        session.server_info = Some(result);
        Ok(session)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_local(&self) -> bool {
        self.transport.is_none()
    }

    /// Server identity reported during `initialize`.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref().map(|r| &r.server_info)
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    /// Fetch every page of `tools/list`.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let Some(transport) = &self.transport else {
            return Ok(self.local_tools.clone());
        };

        let listing_failed =
            |reason: String| McpError::ToolListingFailed(format!("{}: {reason}", self.server_name));

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let request = JsonRpcRequest::new(self.next_request_id(), "tools/list", params);
            let response = transport
                .request(request)
                .await
                .map_err(|e| listing_failed(e.to_string()))?;

            if let Some(error) = response.error {
                return Err(listing_failed(error.message));
            }

            let page: ListToolsResult = response
                .result
                .ok_or_else(|| listing_failed("missing tools/list result".to_string()))
                .and_then(|v| serde_json::from_value(v).map_err(|e| listing_failed(e.to_string())))?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.clone()) {
                        return Err(listing_failed(format!("repeated cursor '{next}'")));
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        info!(server = %self.server_name, tool_count = tools.len(), "Discovered MCP tools");
        Ok(tools)
    }

    /// Invoke a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let Some(transport) = &self.transport else {
            return Err(McpError::tool_error(format!(
                "'{}' is an in-process server; its tools run locally",
                self.server_name
            )));
        };

        debug!(tool = name, server = %self.server_name, "Calling MCP tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );

        let response = transport.request(request).await?;
        if let Some(error) = response.error {
            return Err(McpError::tool_error(error.message));
        }

        serde_json::from_value(
            response
                .result
                .ok_or_else(|| McpError::protocol_error("Missing tools/call result"))?,
        )
        .map_err(|e| McpError::protocol_error(e.to_string()))
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> McpResult<()> {
        match &self.transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("server_name", &self.server_name)
            .field("local", &self.is_local())
            .finish_non_exhaustive()
    }
}
