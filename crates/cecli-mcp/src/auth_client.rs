//! HTTP client bound to an optional OAuth provider.

use crate::error::{McpError, McpResult};
use crate::oauth::OAuthProvider;
use crate::server::ServerConfig;
use crate::settings::ConnectionSettings;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Maximum redirects followed per request.
const MAX_REDIRECTS: usize = 10;

/// HTTP client shared by the SSE and streamable HTTP transports.
///
/// Static headers from the server config are sent with every request. When
/// the config carries no `Authorization` header, an [`OAuthProvider`] adds a
/// bearer token and handles 401 responses.
pub struct AuthClient {
    server_name: String,
    http: Client,
    timeout: Duration,
    provider: Option<Arc<OAuthProvider>>,
}

impl AuthClient {
    /// Build the client for an HTTP server config.
    pub fn new(config: &ServerConfig, settings: &Arc<ConnectionSettings>) -> McpResult<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                McpError::connection_failed(format!("Invalid header name '{key}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                McpError::connection_failed(format!("Invalid value for header '{key}': {e}"))
            })?;
            headers.insert(name, value);
        }

        // Request timeouts are applied per request so that long-lived event
        // streams are not cut off.
        let http = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.http_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| {
                McpError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        let provider = if config.has_static_authorization() {
            debug!(server = %config.name, "Static Authorization header, OAuth disabled");
            None
        } else {
            Some(Arc::new(OAuthProvider::new(
                config.name.clone(),
                &config.url,
                settings.clone(),
            )?))
        };

        Ok(Self {
            server_name: config.name.clone(),
            http,
            timeout: settings.http_timeout,
            provider,
        })
    }

    /// The OAuth provider, if this server may use OAuth.
    pub fn provider(&self) -> Option<&Arc<OAuthProvider>> {
        self.provider.as_ref()
    }

    /// Send a request with the per-request timeout.
    ///
    /// `build` is called once per attempt; a 401 triggers the OAuth flow and
    /// exactly one retry.
    pub async fn send<F>(&self, build: F) -> McpResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send_with(build, Some(self.timeout)).await
    }

    /// Like [`send`](Self::send) but without a total timeout, for event streams.
    pub async fn open_stream<F>(&self, build: F) -> McpResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        self.send_with(build, None).await
    }

    /// Send with the current token only; a 401 is returned as
    /// [`McpError::AuthRequired`] and never starts the browser flow.
    ///
    /// Used for teardown and for replies to server requests, which must not
    /// block on user interaction.
    pub async fn send_without_reauth<F>(&self, build: F) -> McpResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.current_token().await;
        let response = self
            .dispatch(&build, token.as_deref(), Some(self.timeout))
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(server = %self.server_name, "Request rejected, not re-authorizing");
            return Err(McpError::AuthRequired);
        }
        Ok(response)
    }

    async fn current_token(&self) -> Option<String> {
        match &self.provider {
            Some(provider) => provider.access_token().await,
            None => None,
        }
    }

    async fn send_with<F>(&self, build: F, timeout: Option<Duration>) -> McpResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.current_token().await;

        let response = self.dispatch(&build, token.as_deref(), timeout).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(provider) = &self.provider else {
            return Err(McpError::AuthRequired);
        };

        info!(server = %self.server_name, "MCP server requires authentication");
        let token = provider.handle_unauthorized(token.as_deref()).await?;

        let response = self.dispatch(&build, Some(&token), timeout).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthFailed(format!(
                "MCP server '{}' rejected the new access token",
                self.server_name
            )));
        }
        Ok(response)
    }

    async fn dispatch<F>(
        &self,
        build: &F,
        token: Option<&str>,
        timeout: Option<Duration>,
    ) -> McpResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.http);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        request.send().await.map_err(send_error)
    }
}

/// Map a reqwest send failure onto the error taxonomy.
pub(crate) fn send_error(e: reqwest::Error) -> McpError {
    if e.is_timeout() {
        McpError::Timeout
    } else if e.is_connect() {
        McpError::connection_failed(format!("Connection failed: {e}"))
    } else {
        McpError::protocol_error(format!("Request failed: {e}"))
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("server_name", &self.server_name)
            .field("oauth", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cecli_auth::{StoredClientInfo, StoredTokens, TokenStore};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(dir: &TempDir) -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings::new(TokenStore::new(
            dir.path().join("tokens.json"),
        )))
    }

    #[tokio::test]
    async fn test_static_headers_sent() {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ServerConfig::http("remote", format!("{}/mcp", server.uri()))
            .with_header("X-Api-Key", "secret");
        let client = AuthClient::new(&config, &settings(&dir)).unwrap();
        assert!(client.provider().is_some());

        let url = format!("{}/mcp", server.uri());
        let response = client.send(|http| http.get(&url)).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_static_authorization_disables_oauth() {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let config = ServerConfig::http("remote", server.uri())
            .with_header("Authorization", "Bearer static");
        let client = AuthClient::new(&config, &settings(&dir)).unwrap();
        assert!(client.provider().is_none());

        let url = server.uri();
        let result = client.send(|http| http.get(&url)).await;
        assert!(matches!(result, Err(McpError::AuthRequired)));
    }

    #[tokio::test]
    async fn test_invalid_header_rejected() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::http("remote", "https://example.com/mcp")
            .with_header("bad header", "v");
        assert!(matches!(
            AuthClient::new(&config, &settings(&dir)),
            Err(McpError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_stored_token_attached() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        settings
            .token_store
            .set_tokens("remote", StoredTokens::bearer("stored"))
            .await
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer stored"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ServerConfig::http("remote", server.uri());
        let client = AuthClient::new(&config, &settings).unwrap();
        let url = server.uri();
        let response = client.send(|http| http.post(&url)).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_retries() {
        let dir = TempDir::new().unwrap();
        let settings = settings(&dir);
        let server = MockServer::start().await;

        let mut client_info = StoredClientInfo::new("client", "http://localhost:1/callback");
        client_info.token_endpoint = Some(format!("{}/token", server.uri()));
        settings
            .token_store
            .set_client_info("remote", client_info)
            .await
            .unwrap();
        let mut stale = StoredTokens::bearer("stale");
        stale.refresh_token = Some("r".to_string());
        settings
            .token_store
            .set_tokens("remote", stale)
            .await
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = ServerConfig::http("remote", format!("{}/mcp", server.uri()));
        let client = AuthClient::new(&config, &settings).unwrap();
        let url = format!("{}/mcp", server.uri());
        let response = client.send(|http| http.post(&url)).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    /// Counts prompts; never completes a flow.
    struct CountingPrompt(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl crate::settings::AuthorizationPrompt for CountingPrompt {
        async fn prompt(&self, _server: &str, _auth_url: &str) -> McpResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_without_reauth_never_prompts() {
        let dir = TempDir::new().unwrap();
        let prompt = Arc::new(CountingPrompt(Default::default()));
        let settings = Arc::new(
            ConnectionSettings::new(TokenStore::new(dir.path().join("tokens.json")))
                .with_prompt(prompt.clone())
                .with_callback_timeout(Duration::from_secs(30)),
        );
        settings
            .token_store
            .set_tokens("remote", StoredTokens::bearer("revoked"))
            .await
            .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let config = ServerConfig::http("remote", format!("{}/mcp", server.uri()));
        let client = AuthClient::new(&config, &settings).unwrap();
        let url = format!("{}/mcp", server.uri());

        let started = std::time::Instant::now();
        let result = client.send_without_reauth(|http| http.delete(&url)).await;
        assert!(matches!(result, Err(McpError::AuthRequired)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(prompt.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::http("remote", "http://127.0.0.1:1/mcp")
            .with_header("Authorization", "Bearer x");
        let client = AuthClient::new(&config, &settings(&dir)).unwrap();
        let result = client.send(|http| http.get("http://127.0.0.1:1/mcp")).await;
        assert!(matches!(
            result,
            Err(McpError::ConnectionFailed(_)) | Err(McpError::ProtocolError(_))
        ));
    }
}
