//! Streamable HTTP transport for remote MCP servers.
//!
//! Every message is an HTTP POST to the server URL. The server answers with
//! either a JSON body or a `text/event-stream` carrying the response, and
//! may assign a session id that is echoed on every later request.

use crate::auth_client::AuthClient;
use crate::error::{McpError, McpResult};
use crate::event_stream::SseParser;
use crate::protocol::{
    reply_to_server_request, IncomingMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Session id header assigned by the server.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    name: String,
    url: String,
    client: Arc<AuthClient>,
    connected: AtomicBool,
    session_id: RwLock<Option<String>>,
    request_timeout: Duration,
}

impl StreamableHttpTransport {
    /// Create a transport; no request is made until the first message.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        client: Arc<AuthClient>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
            connected: AtomicBool::new(true),
            session_id: RwLock::new(None),
            request_timeout,
        }
    }

    /// The session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Build request with common headers.
    fn build_request<T: Serialize>(
        http: &Client,
        url: &str,
        session_id: Option<&str>,
        body: &T,
    ) -> RequestBuilder {
        let mut req = http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);

        if let Some(id) = session_id {
            req = req.header(SESSION_ID_HEADER, id);
        }

        req
    }

    /// POST one message and record any session id in the reply.
    async fn post<T: Serialize>(&self, body: &T) -> McpResult<Response> {
        let session_id = self.session_id().await;
        let response = self
            .client
            .send(|http| Self::build_request(http, &self.url, session_id.as_deref(), body))
            .await?;
        self.record_session(&response).await;
        Ok(response)
    }

    /// POST a reply to a server request. A 401 fails instead of prompting.
    async fn post_reply<T: Serialize>(&self, body: &T) -> McpResult<Response> {
        let session_id = self.session_id().await;
        let response = self
            .client
            .send_without_reauth(|http| {
                Self::build_request(http, &self.url, session_id.as_deref(), body)
            })
            .await?;
        self.record_session(&response).await;
        Ok(response)
    }

    async fn record_session(&self, response: &Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.write().await;
            if current.as_deref() != Some(id) {
                debug!(server = %self.name, session_id = %id, "MCP session assigned");
                *current = Some(id.to_string());
            }
        }
    }

    /// Read the response to request `id` from a POST reply.
    async fn read_response(&self, id: u64, response: Response) -> McpResult<JsonRpcResponse> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND && self.session_id().await.is_some() {
            *self.session_id.write().await = None;
            return Err(McpError::connection_failed(format!(
                "MCP session for '{}' expired",
                self.name
            )));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.read_event_stream(id, response).await
        } else {
            let value: Value = response
                .json()
                .await
                .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))?;
            let messages = match value {
                Value::Array(items) => items,
                single => vec![single],
            };
            for message in messages {
                if let Some(response) = self.dispatch(id, message).await {
                    return Ok(response);
                }
            }
            Err(McpError::protocol_error(format!(
                "No response for request {id}"
            )))
        }
    }

    /// Read events until the response to `id` arrives.
    async fn read_event_stream(&self, id: u64, response: Response) -> McpResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;

            for event in parser.feed(&chunk) {
                if event.event != "message" {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(message) => {
                        if let Some(response) = self.dispatch(id, message).await {
                            return Ok(response);
                        }
                    }
                    Err(e) => debug!(server = %self.name, error = %e, "Ignoring malformed event"),
                }
            }
        }

        Err(McpError::protocol_error(
            "SSE stream ended without response",
        ))
    }

    /// Handle one incoming message; returns it if it answers `id`.
    async fn dispatch(&self, id: u64, message: Value) -> Option<JsonRpcResponse> {
        match IncomingMessage::classify(message)? {
            IncomingMessage::Response(response) if response.id == id => Some(response),
            IncomingMessage::Response(response) => {
                debug!(server = %self.name, id = response.id, "Unexpected response id");
                None
            }
            IncomingMessage::Request { id: request_id, method } => {
                let reply = reply_to_server_request(&request_id, &method);
                if let Err(e) = self.post_reply(&reply).await {
                    debug!(server = %self.name, error = %e, "Failed to answer server request");
                }
                None
            }
            IncomingMessage::Notification { method } => {
                debug!(server = %self.name, method = %method, "Server notification");
                None
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;

        debug!(server = %self.name, id, method = %request.method, "Sending HTTP request");

        // The POST may run the browser flow on a 401; only the reply is timed.
        let response = self.post(&request).await?;

        match tokio::time::timeout(self.request_timeout, self.read_response(id, response)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        debug!(server = %self.name, method = %notification.method, "Sending HTTP notification");

        let response = self.post(&notification).await?;
        let status = response.status();
        if !status.is_success() {
            warn!(server = %self.name, status = %status, "Notification returned non-success status");
            return Err(McpError::protocol_error(format!(
                "Notification {} returned {status}",
                notification.method
            )));
        }

        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(id) = self.session_id.write().await.take() {
            let result = self
                .client
                .send_without_reauth(|http| http.delete(&self.url).header(SESSION_ID_HEADER, &id))
                .await;
            match result {
                Ok(response) => {
                    debug!(server = %self.name, status = %response.status(), "Terminated MCP session")
                }
                Err(e) => debug!(server = %self.name, error = %e, "Failed to terminate MCP session"),
            }
        }

        debug!(server = %self.name, "Closed HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
