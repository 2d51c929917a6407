//! Legacy HTTP+SSE transport for remote MCP servers.
//!
//! The client holds a GET event stream open. The server's first `endpoint`
//! event names the URL that requests are POSTed to; responses come back as
//! `message` events on the stream.

use crate::auth_client::AuthClient;
use crate::error::{McpError, McpResult};
use crate::event_stream::SseParser;
use crate::protocol::{
    reply_to_server_request, IncomingMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// SSE transport for remote MCP servers.
pub struct SseTransport {
    name: String,
    endpoint: String,
    client: Arc<AuthClient>,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        client: Arc<AuthClient>,
        request_timeout: Duration,
    ) -> McpResult<Self> {
        let name = name.into();
        let base = url::Url::parse(url)
            .map_err(|e| McpError::connection_failed(format!("Invalid SSE URL '{url}': {e}")))?;

        let response = client
            .open_stream(|http| http.get(url).header(ACCEPT, "text/event-stream"))
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::connection_failed(format!(
                "SSE connection returned {status}: {text}"
            )));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();

        let endpoint = tokio::time::timeout(
            request_timeout,
            wait_for_endpoint(&mut stream, &mut parser),
        )
        .await
        .map_err(|_| McpError::connection_failed("Timed out waiting for SSE endpoint event"))??;

        let endpoint = base
            .join(&endpoint)
            .map_err(|e| McpError::connection_failed(format!("Invalid SSE endpoint: {e}")))?
            .to_string();

        info!(server = %name, endpoint = %endpoint, "SSE endpoint received");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_events(
            EventContext {
                name: name.clone(),
                endpoint: endpoint.clone(),
                client: client.clone(),
                pending: pending.clone(),
                connected: connected.clone(),
            },
            stream,
            parser,
        ));

        Ok(Self {
            name,
            endpoint,
            client,
            pending,
            reader: Mutex::new(Some(reader)),
            connected,
            request_timeout,
        })
    }

    /// The URL requests are POSTed to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: &Value) -> McpResult<()> {
        post_message(&self.client, &self.endpoint, body).await
    }
}

async fn wait_for_endpoint<S, B>(stream: &mut S, parser: &mut SseParser) -> McpResult<String>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| McpError::connection_failed(format!("Stream error: {e}")))?;
        for event in parser.feed(chunk.as_ref()) {
            if event.event == "endpoint" {
                return Ok(event.data.trim().to_string());
            }
            debug!(event = %event.event, "Ignoring event before endpoint");
        }
    }
    Err(McpError::connection_failed(
        "SSE stream ended before endpoint event",
    ))
}

async fn post_message(client: &AuthClient, endpoint: &str, body: &Value) -> McpResult<()> {
    let response = client.send(|http| http.post(endpoint).json(body)).await?;
    accepted(response).await
}

/// Answer a server request. A 401 fails instead of prompting.
async fn post_reply(client: &AuthClient, endpoint: &str, body: &Value) -> McpResult<()> {
    let response = client
        .send_without_reauth(|http| http.post(endpoint).json(body))
        .await?;
    accepted(response).await
}

async fn accepted(response: reqwest::Response) -> McpResult<()> {
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::protocol_error(format!(
            "Server returned {status}: {text}"
        )));
    }
    Ok(())
}

/// State the background reader shares with the transport.
struct EventContext {
    name: String,
    endpoint: String,
    client: Arc<AuthClient>,
    pending: Pending,
    connected: Arc<AtomicBool>,
}

async fn read_events<S, B>(ctx: EventContext, mut stream: S, mut parser: SseParser)
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(server = %ctx.name, error = %e, "SSE stream error");
                break;
            }
        };

        for event in parser.feed(chunk.as_ref()) {
            if event.event != "message" {
                debug!(server = %ctx.name, event = %event.event, "Ignoring SSE event");
                continue;
            }
            let value = match serde_json::from_str::<Value>(&event.data) {
                Ok(value) => value,
                Err(e) => {
                    debug!(server = %ctx.name, error = %e, "Ignoring malformed SSE message");
                    continue;
                }
            };

            match IncomingMessage::classify(value) {
                Some(IncomingMessage::Response(response)) => {
                    if let Some(tx) = ctx.pending.lock().await.remove(&response.id) {
                        let _ = tx.send(response);
                    } else {
                        debug!(server = %ctx.name, id = response.id, "Response for unknown request");
                    }
                }
                Some(IncomingMessage::Request { id, method }) => {
                    let reply = reply_to_server_request(&id, &method);
                    if let Err(e) = post_reply(&ctx.client, &ctx.endpoint, &reply).await {
                        debug!(server = %ctx.name, error = %e, "Failed to answer server request");
                    }
                }
                Some(IncomingMessage::Notification { method }) => {
                    debug!(server = %ctx.name, method = %method, "Server notification");
                }
                None => {}
            }
        }
    }

    ctx.connected.store(false, Ordering::SeqCst);
    ctx.pending.lock().await.clear();
    debug!(server = %ctx.name, "SSE stream closed");
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request without id"))?;

        if !self.is_connected() {
            return Err(McpError::connection_failed(format!(
                "SSE stream for '{}' is closed",
                self.name
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!(server = %self.name, id, method = %request.method, "Sending SSE request");
        if let Err(e) = self.post(&serde_json::to_value(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::connection_failed(format!(
                "SSE stream for '{}' closed before response",
                self.name
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        debug!(server = %self.name, method = %notification.method, "Sending SSE notification");

        self.post(&serde_json::to_value(&notification)?)
            .await
            .map_err(|e| {
                warn!(server = %self.name, error = %e, "Notification failed");
                e
            })
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
        debug!(server = %self.name, "Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use crate::settings::ConnectionSettings;
    use cecli_auth::TokenStore;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(dir: &TempDir, url: &str) -> Arc<AuthClient> {
        let settings = Arc::new(ConnectionSettings::new(TokenStore::new(
            dir.path().join("tokens.json"),
        )));
        let config = ServerConfig::sse("remote", url).with_header("Authorization", "Bearer t");
        Arc::new(AuthClient::new(&config, &settings).unwrap())
    }

    /// Read one HTTP request; returns the request line and body.
    async fn read_request(stream: &mut BufReader<TcpStream>) -> (String, String) {
        let mut request_line = String::new();
        stream.read_line(&mut request_line).await.unwrap();

        let mut content_length = 0;
        loop {
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                if key.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }

        let mut body = vec![0u8; content_length];
        stream.read_exact(&mut body).await.unwrap();
        (request_line, String::from_utf8(body).unwrap())
    }

    /// A minimal legacy SSE server that answers POSTs with `post_status` and
    /// echoes each request's id back as a `message` event.
    async fn spawn_sse_server(post_status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (events, _) = listener.accept().await.unwrap();
            let mut events = BufReader::new(events);
            let (request_line, _) = read_request(&mut events).await;
            assert!(request_line.starts_with("GET /sse"));

            let mut events = events.into_inner();
            events
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\n\
                      : hello\n\nevent: endpoint\ndata: /messages?session_id=abc\n\n",
                )
                .await
                .unwrap();

            loop {
                let Ok((post, _)) = listener.accept().await else {
                    break;
                };
                let mut post = BufReader::new(post);
                let (request_line, body) = read_request(&mut post).await;
                assert!(request_line.starts_with("POST /messages?session_id=abc"));
                let reply = format!(
                    "HTTP/1.1 {post_status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                post.into_inner().write_all(reply.as_bytes()).await.unwrap();

                let message: Value = serde_json::from_str(&body).unwrap();
                if let Some(id) = message.get("id") {
                    let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"echo": message["method"]}});
                    let event = format!("event: message\ndata: {reply}\n\n");
                    if events.write_all(event.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });

        format!("http://{addr}/sse")
    }

    #[tokio::test]
    async fn test_endpoint_and_round_trip() {
        let dir = TempDir::new().unwrap();
        let url = spawn_sse_server("202 Accepted").await;

        let transport = SseTransport::connect("remote", &url, client(&dir, &url), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(transport.endpoint().ends_with("/messages?session_id=abc"));
        assert!(transport.endpoint().starts_with("http://127.0.0.1:"));

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();

        let response = transport
            .request(JsonRpcRequest::new(1, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.result, Some(json!({"echo": "tools/list"})));

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stream_without_endpoint() {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("event: message\ndata: {}\n\n"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/sse", server.uri());
        let result = SseTransport::connect("remote", &url, client(&dir, &url), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(McpError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/sse", server.uri());
        let result = SseTransport::connect("remote", &url, client(&dir, &url), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(McpError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_rejected_notification_is_error() {
        let dir = TempDir::new().unwrap();
        let url = spawn_sse_server("400 Bad Request").await;

        let transport = SseTransport::connect("remote", &url, client(&dir, &url), Duration::from_secs(5))
            .await
            .unwrap();
        let result = transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await;
        match result {
            Err(McpError::ProtocolError(msg)) => assert!(msg.contains("400")),
            other => panic!("Expected ProtocolError, got {:?}", other),
        }

        transport.close().await.unwrap();
    }
}
