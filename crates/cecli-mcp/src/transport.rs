//! The seam between a session and its wire.

use crate::error::McpResult;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;

/// A JSON-RPC channel to one MCP server.
///
/// Implemented by the stdio, SSE and streamable HTTP transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response with the same id.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification; no response is expected.
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Release the channel. Safe to call more than once.
    async fn close(&self) -> McpResult<()>;

    fn is_connected(&self) -> bool;
}
