//! OAuth callback server for MCP authentication.
//!
//! A throwaway HTTP listener on the loopback interface that captures the
//! authorization code (or error) from the browser redirect and hands it to
//! the waiting OAuth flow through a oneshot channel.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default callback path.
pub const OAUTH_CALLBACK_PATH: &str = "/callback";

/// How long to wait for the browser redirect.
pub const OAUTH_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// HTML response for successful authorization.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Cecli - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #16a34a; margin-bottom: 1rem; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Success!</h1>
    <p>Authentication successful. You can close this browser tab.</p>
  </div>
</body>
</html>"#;

/// HTML response for failed authorization.
fn html_error(title: &str, detail: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Cecli - {title}</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #dc2626; margin-bottom: 1rem; }}
    .error {{ font-family: monospace; margin-top: 1rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>{title}</h1>
    <div class="error">{detail}</div>
  </div>
</body>
</html>"#,
        title = html_escape(title),
        detail = html_escape(detail),
    )
}

/// Escape HTML special characters.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Parameters delivered by a successful redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: Option<String>,
}

/// What the handler hands to the waiting flow.
#[derive(Debug)]
enum CallbackOutcome {
    Code(CallbackParams),
    Failed(String),
}

/// Sender side of the hand-off; taken by the first completing request.
type Signal = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

/// A running OAuth callback listener.
///
/// The listener stops when [`wait`](Self::wait) returns, when
/// [`shutdown`](Self::shutdown) is called, or when the value is dropped.
pub struct OAuthCallbackServer {
    port: u16,
    path: String,
    result_rx: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl OAuthCallbackServer {
    /// Bind `localhost:port` and start serving `path`.
    pub async fn start(port: u16, path: impl Into<String>) -> McpResult<Self> {
        let path = path.into();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            McpError::connection_failed(format!("Failed to bind OAuth callback server: {e}"))
        })?;
        let port = listener.local_addr()?.port();

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let signal: Signal = Arc::new(Mutex::new(Some(result_tx)));

        info!(port, path = %path, "OAuth callback server started");

        let served_path = path.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let signal = signal.clone();
                                let path = served_path.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, &path, signal).await {
                                        warn!(error = %e, "Error handling OAuth callback");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Error accepting connection");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!(port, "OAuth callback server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            port,
            path,
            result_rx: Some(result_rx),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URI this server answers.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }

    /// Wait for the redirect, shutting the listener down on every exit path.
    pub async fn wait(&mut self, timeout: Duration) -> McpResult<CallbackParams> {
        let Some(rx) = self.result_rx.take() else {
            self.shutdown();
            return Err(McpError::AuthFailed(
                "OAuth callback result already consumed".to_string(),
            ));
        };

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.shutdown();

        match outcome {
            Ok(Ok(CallbackOutcome::Code(params))) => Ok(params),
            Ok(Ok(CallbackOutcome::Failed(reason))) => Err(McpError::OAuthServerError(reason)),
            Ok(Err(_)) => Err(McpError::AuthFailed(
                "OAuth callback server stopped without a result".to_string(),
            )),
            Err(_) => Err(McpError::OAuthTimeout(timeout.as_secs())),
        }
    }

    /// Stop the listener. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Whether the listener has been told to stop.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_tx.is_none()
    }
}

impl Drop for OAuthCallbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Deliver the outcome to the waiting flow if nobody has yet.
fn complete(signal: &Signal, outcome: CallbackOutcome) {
    let sender = match signal.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(tx) = sender {
        let _ = tx.send(outcome);
    }
}

/// Handle an incoming HTTP connection.
async fn handle_connection(mut stream: TcpStream, path: &str, signal: Signal) -> McpResult<()> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();

    if parts.len() < 2 {
        let response = http_response(400, "text/plain", "Bad Request");
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    if parts[0] != "GET" {
        let response = http_response(405, "text/plain", "Method Not Allowed");
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    let parsed = match url::Url::parse(&format!("http://localhost{}", parts[1])) {
        Ok(u) => u,
        Err(_) => {
            let response = http_response(400, "text/plain", "Invalid URL");
            stream.write_all(response.as_bytes()).await.ok();
            return Ok(());
        }
    };

    if parsed.path() != path {
        let html = html_error("Not Found", parsed.path());
        let response = http_response(404, "text/html", &html);
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    debug!(
        has_code = params.contains_key("code"),
        has_state = params.contains_key("state"),
        error = ?params.get("error"),
        "Received OAuth callback"
    );

    let (status, html, outcome) = if let Some(code) = params.get("code") {
        let outcome = CallbackOutcome::Code(CallbackParams {
            code: code.clone(),
            state: params.get("state").cloned(),
        });
        (200, HTML_SUCCESS.to_string(), outcome)
    } else if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(String::as_str)
            .unwrap_or("");
        let reason = format!("{error} - {description}");
        let html = html_error("Authentication Failed", &format!("{error}: {description}"));
        (400, html, CallbackOutcome::Failed(reason))
    } else {
        let reason = "No authorization code received".to_string();
        let html = html_error("Invalid Request", &reason);
        (400, html, CallbackOutcome::Failed(reason))
    };

    let response = http_response(status, "text/html", &html);
    stream.write_all(response.as_bytes()).await.ok();
    complete(&signal, outcome);

    Ok(())
}

/// Build an HTTP response.
fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::is_port_available;

    async fn start() -> OAuthCallbackServer {
        OAuthCallbackServer::start(0, OAUTH_CALLBACK_PATH)
            .await
            .unwrap()
    }

    fn url(server: &OAuthCallbackServer, path_and_query: &str) -> String {
        format!("http://127.0.0.1:{}{}", server.port(), path_and_query)
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("a & b"), "a &amp; b");
        assert_eq!(html_escape("it's \"quoted\""), "it&#39;s &quot;quoted&quot;");
        assert_eq!(html_escape("hello world"), "hello world");
    }

    #[test]
    fn test_html_error_escapes_detail() {
        let html = html_error("Authentication Failed", "<script>alert('xss')</script>");
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_http_response_format() {
        let response = http_response(404, "text/plain", "nope");
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Content-Length: 4\r\n"));
        assert!(response.ends_with("\r\n\r\nnope"));
    }

    #[tokio::test]
    async fn test_redirect_uri() {
        let server = start().await;
        assert_eq!(
            server.redirect_uri(),
            format!("http://localhost:{}/callback", server.port())
        );
    }

    #[tokio::test]
    async fn test_code_delivered() {
        let mut server = start().await;

        let response = reqwest::get(url(&server, "/callback?code=abc123&state=xyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("Success!"));

        let params = server.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.code, "abc123");
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(server.is_shut_down());
    }

    #[tokio::test]
    async fn test_error_delivered() {
        let mut server = start().await;

        let response = reqwest::get(url(
            &server,
            "/callback?error=access_denied&error_description=User%20said%20no",
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 400);
        assert!(response.text().await.unwrap().contains("Authentication Failed"));

        match server.wait(Duration::from_secs(5)).await {
            Err(McpError::OAuthServerError(reason)) => {
                assert_eq!(reason, "access_denied - User said no");
            }
            other => panic!("Expected OAuthServerError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_code_and_error() {
        let mut server = start().await;

        let response = reqwest::get(url(&server, "/callback?state=only"))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        match server.wait(Duration::from_secs(5)).await {
            Err(McpError::OAuthServerError(reason)) => {
                assert_eq!(reason, "No authorization code received");
            }
            other => panic!("Expected OAuthServerError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_path_does_not_signal() {
        let mut server = start().await;

        let response = reqwest::get(url(&server, "/favicon.ico")).await.unwrap();
        assert_eq!(response.status(), 404);

        let result = server.wait(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(McpError::OAuthTimeout(_))));
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let mut server = start().await;

        reqwest::get(url(&server, "/callback?code=first"))
            .await
            .unwrap();
        reqwest::get(url(&server, "/callback?code=second"))
            .await
            .unwrap();

        let params = server.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.code, "first");
    }

    #[tokio::test]
    async fn test_timeout_releases_port() {
        let mut server = start().await;
        let port = server.port();

        let result = server.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(McpError::OAuthTimeout(_))));

        let mut released = false;
        for _ in 0..100 {
            if is_port_available(port) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "listener still bound after timeout");
    }

    #[tokio::test]
    async fn test_wait_twice() {
        let mut server = start().await;
        let _ = server.wait(Duration::from_millis(10)).await;
        assert!(matches!(
            server.wait(Duration::from_millis(10)).await,
            Err(McpError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let mut server = start().await;
        server.shutdown();
        server.shutdown();
        assert!(server.is_shut_down());
    }
}
