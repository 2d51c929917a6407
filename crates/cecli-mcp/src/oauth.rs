//! OAuth support for MCP remote servers.
//!
//! Implements the OAuth 2.0 authorization code flow with PKCE:
//! metadata discovery, dynamic client registration, a browser round trip
//! through a local callback server, code exchange, and refresh. Tokens and
//! the client registration are persisted to the token store so later runs
//! can skip the browser.

use crate::callback::OAuthCallbackServer;
use crate::error::{McpError, McpResult};
use crate::pkce::{generate_pkce, generate_state};
use crate::port::{find_available_port, is_port_available};
use crate::protocol::PROTOCOL_VERSION;
use crate::settings::ConnectionSettings;
use cecli_auth::{current_time_secs, AuthResult, StoredClientInfo, StoredTokens};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Authorization server metadata (RFC 8414).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// Default endpoints for servers that publish no metadata.
    pub fn fallback(origin: &str) -> Self {
        Self {
            issuer: None,
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
            scopes_supported: Vec::new(),
        }
    }

    /// Space-separated scope to request, if the server lists any.
    pub fn scope(&self) -> Option<String> {
        if self.scopes_supported.is_empty() {
            None
        } else {
            Some(self.scopes_supported.join(" "))
        }
    }
}

/// Derive the authorization server origin (`scheme://host[:port]`) from an
/// MCP server URL.
pub fn auth_server_origin(server_url: &str) -> McpResult<String> {
    let parsed = url::Url::parse(server_url)
        .map_err(|e| McpError::AuthFailed(format!("Invalid server URL '{server_url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => {
            Ok(parsed.origin().ascii_serialization())
        }
        _ => Err(McpError::AuthFailed(format!(
            "Server URL '{server_url}' is not an http(s) URL"
        ))),
    }
}

/// Port of a stored redirect URI, if it names one.
fn redirect_port(redirect_uri: &str) -> Option<u16> {
    url::Url::parse(redirect_uri).ok()?.port()
}

/// Build authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Fetch authorization server metadata, falling back to default endpoints.
pub async fn discover_metadata(http: &reqwest::Client, origin: &str) -> AuthServerMetadata {
    let url = format!("{origin}/.well-known/oauth-authorization-server");
    let response = http
        .get(&url)
        .header("MCP-Protocol-Version", PROTOCOL_VERSION)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            match response.json::<AuthServerMetadata>().await {
                Ok(metadata) => {
                    debug!(origin = %origin, "Discovered OAuth metadata");
                    return metadata;
                }
                Err(e) => debug!(origin = %origin, error = %e, "Invalid OAuth metadata"),
            }
        }
        Ok(response) => {
            debug!(origin = %origin, status = %response.status(), "No OAuth metadata published");
        }
        Err(e) => debug!(origin = %origin, error = %e, "OAuth metadata request failed"),
    }

    AuthServerMetadata::fallback(origin)
}

/// Register a public client (RFC 7591).
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    client_name: &str,
    redirect_uri: &str,
) -> McpResult<StoredClientInfo> {
    let body = json!({
        "client_name": client_name,
        "redirect_uris": [redirect_uri],
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    let response = http
        .post(registration_endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Client registration request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!(
            "Client registration failed ({status}): {text}"
        )));
    }

    let mut info: StoredClientInfo = response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid registration response: {e}")))?;

    if info.redirect_uris.is_empty() {
        info.redirect_uris.push(redirect_uri.to_string());
    }

    info!(client_id = %info.client_id, "Registered OAuth client");
    Ok(info)
}

/// Exchange authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &StoredClientInfo,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<StoredTokens> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client.client_id.as_str()),
        ("code_verifier", code_verifier),
    ];

    if let Some(secret) = client.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }

    token_request(http, token_endpoint, &params, "Token exchange").await
}

/// Refresh tokens using refresh token.
///
/// Servers that do not rotate refresh tokens omit one from the response; the
/// old refresh token is kept in that case.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client: &StoredClientInfo,
    refresh_token: &str,
) -> McpResult<StoredTokens> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
    ];

    if let Some(secret) = client.client_secret.as_deref() {
        params.push(("client_secret", secret));
    }

    let mut tokens = token_request(http, token_endpoint, &params, "Token refresh").await?;
    if tokens.refresh_token.is_none() {
        tokens.refresh_token = Some(refresh_token.to_string());
    }
    Ok(tokens)
}

async fn token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    params: &[(&str, &str)],
    what: &str,
) -> McpResult<StoredTokens> {
    let response = http
        .post(token_endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("{what} request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!("{what} failed: {text}")));
    }

    response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid {what} response: {e}")))
}

/// OAuth provider for one HTTP MCP server.
///
/// Holds the current tokens in memory and drives the full flow when the
/// server answers 401. At most one flow runs at a time per provider.
pub struct OAuthProvider {
    server_name: String,
    origin: String,
    settings: Arc<ConnectionSettings>,
    http: reqwest::Client,
    tokens: RwLock<Option<StoredTokens>>,
    metadata: RwLock<Option<AuthServerMetadata>>,
    flow_lock: Mutex<()>,
}

impl OAuthProvider {
    /// Create a provider for `server_url`.
    pub fn new(
        server_name: impl Into<String>,
        server_url: &str,
        settings: Arc<ConnectionSettings>,
    ) -> McpResult<Self> {
        let server_name = server_name.into();
        let origin = auth_server_origin(server_url)?;
        debug!(server = %server_name, origin = %origin, "Derived OAuth server URL");

        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()?;

        Ok(Self {
            server_name,
            origin,
            settings,
            http,
            tokens: RwLock::new(None),
            metadata: RwLock::new(None),
            flow_lock: Mutex::new(()),
        })
    }

    /// Server this provider authenticates.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Authorization server origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Current access token, loading stored tokens on first use.
    pub async fn access_token(&self) -> Option<String> {
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            return Some(tokens.access_token.clone());
        }

        let stored = self
            .settings
            .token_store
            .get_tokens(&self.server_name)
            .await?;
        debug!(server = %self.server_name, "Loaded stored OAuth tokens");
        let token = stored.access_token.clone();
        *self.tokens.write().await = Some(stored);
        Some(token)
    }

    /// Obtain a new access token after the server rejected `rejected`.
    ///
    /// If another caller already replaced the rejected token, that token is
    /// returned. Otherwise a refresh is tried before the browser flow.
    pub async fn handle_unauthorized(&self, rejected: Option<&str>) -> McpResult<String> {
        let _flow = self.flow_lock.lock().await;

        if let Some(current) = self.tokens.read().await.as_ref() {
            if Some(current.access_token.as_str()) != rejected {
                return Ok(current.access_token.clone());
            }
        }

        if let Some(tokens) = self.try_refresh().await {
            return Ok(tokens.access_token);
        }

        self.authorize().await.map(|tokens| tokens.access_token)
    }

    /// Run the full browser flow and store the resulting tokens.
    pub async fn authorize(&self) -> McpResult<StoredTokens> {
        let metadata = self.metadata().await;
        let (port, stored_client) = self.select_callback().await?;

        let mut callback =
            OAuthCallbackServer::start(port, self.settings.callback_path.clone()).await?;
        let redirect_uri = callback.redirect_uri();

        let client = match stored_client {
            Some(client) => client,
            None => {
                let endpoint = metadata.registration_endpoint.clone().ok_or_else(|| {
                    McpError::AuthFailed(format!(
                        "{} supports no dynamic client registration",
                        self.origin
                    ))
                })?;
                register_client(
                    &self.http,
                    &endpoint,
                    &self.settings.client_name,
                    &redirect_uri,
                )
                .await?
            }
        };

        let pkce = generate_pkce();
        let state = generate_state();
        let scope = metadata.scope();
        let auth_url = build_auth_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &redirect_uri,
            scope.as_deref(),
            &state,
            &pkce.challenge,
        );

        if let Err(e) = self.settings.prompt.prompt(&self.server_name, &auth_url).await {
            callback.shutdown();
            return Err(e);
        }

        let params = callback.wait(self.settings.callback_timeout).await?;
        if params.state.as_deref() != Some(state.as_str()) {
            warn!(server = %self.server_name, "OAuth state mismatch");
            return Err(McpError::AuthFailed("OAuth state mismatch".to_string()));
        }

        let tokens = exchange_code(
            &self.http,
            &metadata.token_endpoint,
            &client,
            &params.code,
            &redirect_uri,
            &pkce.verifier,
        )
        .await?;

        let mut client = client;
        client.token_endpoint = Some(metadata.token_endpoint.clone());
        client.redirect_uris = vec![redirect_uri];
        self.persist(Some(client), &tokens).await;

        *self.tokens.write().await = Some(tokens.clone());
        info!(server = %self.server_name, "OAuth authorization complete");
        Ok(tokens)
    }

    async fn metadata(&self) -> AuthServerMetadata {
        if let Some(metadata) = self.metadata.read().await.as_ref() {
            return metadata.clone();
        }
        let metadata = discover_metadata(&self.http, &self.origin).await;
        *self.metadata.write().await = Some(metadata.clone());
        metadata
    }

    /// Pick the callback port and the stored client to reuse with it.
    ///
    /// A stored client is only usable if its redirect port can be bound
    /// again; otherwise a fresh port needs a fresh registration.
    async fn select_callback(&self) -> McpResult<(u16, Option<StoredClientInfo>)> {
        let stored = self
            .settings
            .token_store
            .get_client_info(&self.server_name)
            .await;

        if let Some(info) = stored {
            if info.secret_expired(current_time_secs()) {
                info!(server = %self.server_name, "Stored OAuth client secret expired");
            } else {
                match info.redirect_uri().and_then(redirect_port) {
                    Some(port) if is_port_available(port) => {
                        debug!(server = %self.server_name, port, "Reusing OAuth callback port");
                        return Ok((port, Some(info)));
                    }
                    Some(port) => {
                        info!(
                            server = %self.server_name,
                            port,
                            "Stored OAuth callback port is busy, registering a new client"
                        );
                    }
                    None => {
                        debug!(server = %self.server_name, "Stored OAuth client has no redirect port");
                    }
                }
            }
        }

        let (start, end) = (
            self.settings.callback_port_start,
            self.settings.callback_port_end,
        );
        let port = find_available_port(start, end).ok_or(McpError::PortExhausted { start, end })?;
        Ok((port, None))
    }

    async fn try_refresh(&self) -> Option<StoredTokens> {
        let current = match self.tokens.read().await.clone() {
            Some(tokens) => Some(tokens),
            None => {
                self.settings
                    .token_store
                    .get_tokens(&self.server_name)
                    .await
            }
        }?;
        let refresh_token = current.refresh_token.as_deref()?;
        let client = self
            .settings
            .token_store
            .get_client_info(&self.server_name)
            .await?;

        let token_endpoint = match client.token_endpoint.clone() {
            Some(endpoint) => endpoint,
            None => self.metadata().await.token_endpoint,
        };

        match refresh_tokens(&self.http, &token_endpoint, &client, refresh_token).await {
            Ok(tokens) => {
                info!(server = %self.server_name, "Refreshed OAuth tokens");
                self.persist(None, &tokens).await;
                *self.tokens.write().await = Some(tokens.clone());
                Some(tokens)
            }
            Err(e) => {
                info!(server = %self.server_name, error = %e, "OAuth refresh failed");
                None
            }
        }
    }

    /// Write tokens (and client info) to disk. Failure is logged only.
    async fn persist(&self, client: Option<StoredClientInfo>, tokens: &StoredTokens) {
        let store = &self.settings.token_store;
        let result: AuthResult<()> = async {
            if let Some(client) = client {
                store.set_client_info(&self.server_name, client).await?;
            }
            store.set_tokens(&self.server_name, tokens.clone()).await
        }
        .await;

        if let Err(e) = result {
            let e = McpError::from(e);
            warn!(server = %self.server_name, error = %e, "OAuth tokens kept in memory only");
        }
    }
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("server_name", &self.server_name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}
