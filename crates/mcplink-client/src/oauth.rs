//! OAuth 2.0 building blocks for MCP servers.
//!
//! Authorization server discovery (RFC 9728 / RFC 8414), dynamic client
//! registration (RFC 7591), PKCE, and the token endpoint calls.

use crate::error::{AuthError, AuthResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

/// OAuth tokens as returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Client metadata sent to the registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ClientMetadata {
    /// Metadata for an authorization-code client redirecting to `redirect_uri`.
    pub fn new(client_name: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            redirect_uris: vec![redirect_uri.into()],
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: "client_secret_post".to_string(),
            scope: None,
        }
    }

    /// Set the requested scope.
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// The first redirect URI, used for the authorization request.
    pub fn redirect_uri(&self) -> Option<&str> {
        self.redirect_uris.first().map(String::as_str)
    }
}

/// Client information (from dynamic registration or config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<String>,
    #[serde(default)]
    pub response_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

impl ClientRegistration {
    /// A pre-registered public client.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uris: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            client_id_issued_at: None,
            client_secret_expires_at: None,
        }
    }

    /// Whether the client secret has expired at `now`. Zero means never.
    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.client_secret_expires_at, Some(exp) if exp != 0 && exp < now)
    }
}

/// Protected resource metadata (RFC 9728), trimmed to what we use.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub authorization_servers: Vec<String>,
}

/// Authorization server metadata (RFC 8414), trimmed to what we use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
}

impl AuthServerMetadata {
    /// Conventional endpoints used when the server publishes no metadata.
    pub fn fallback(auth_server: &Url) -> Self {
        let endpoint = |path: &str| {
            let mut url = auth_server.clone();
            url.set_path(path);
            url.set_query(None);
            url.to_string()
        };
        Self {
            issuer: None,
            authorization_endpoint: endpoint("/authorize"),
            token_endpoint: endpoint("/token"),
            registration_endpoint: Some(endpoint("/register")),
            scopes_supported: None,
        }
    }
}

/// PKCE verifier/challenge pair plus the CSRF `state` for one attempt.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceChallenge {
    /// Generate a fresh set of values.
    pub fn generate() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self {
            verifier,
            challenge,
            state: generate_state(),
        }
    }
}

/// Generate PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generate PKCE code challenge from verifier.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let result = hasher.finalize();
    URL_SAFE_NO_PAD.encode(result)
}

/// Generate OAuth state parameter.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Scheme, host and port of `server_url`, with an empty path.
pub fn server_origin(server_url: &str) -> AuthResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|e| AuthError::Discovery(format!("Invalid server URL '{server_url}': {e}")))?;
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Well-known URL for `base`, inserting the suffix before any path component.
fn well_known_url(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = base.path().trim_end_matches('/').to_string();
    url.set_path(&format!("/.well-known/{suffix}{path}"));
    url.set_query(None);
    url
}

/// GET a JSON document; `None` if the server does not serve it.
async fn fetch_metadata<T: DeserializeOwned>(http: &Client, url: Url) -> AuthResult<Option<T>> {
    debug!(url = %url, "Fetching OAuth metadata");
    let response = http
        .get(url.clone())
        .header("Accept", "application/json")
        .send()
        .await?;

    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "No metadata published");
        return Ok(None);
    }

    let text = response.text().await?;
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| AuthError::Discovery(format!("Invalid metadata at {url}: {e}")))
}

/// Resolve the authorization server endpoints for an MCP server.
pub async fn discover_metadata(http: &Client, server_url: &str) -> AuthResult<AuthServerMetadata> {
    let origin = server_origin(server_url)?;

    let resource_url = well_known_url(&origin, "oauth-protected-resource");
    let auth_server = match fetch_metadata::<ProtectedResourceMetadata>(http, resource_url).await {
        Ok(Some(meta)) => match meta.authorization_servers.first() {
            Some(server) => Url::parse(server).map_err(|e| {
                AuthError::Discovery(format!("Invalid authorization server '{server}': {e}"))
            })?,
            None => origin.clone(),
        },
        // Older servers only publish authorization server metadata.
        Ok(None) | Err(AuthError::Discovery(_)) => origin.clone(),
        Err(e) => return Err(e),
    };

    let metadata_url = well_known_url(&auth_server, "oauth-authorization-server");
    let metadata = match fetch_metadata::<AuthServerMetadata>(http, metadata_url).await? {
        Some(metadata) => metadata,
        None => {
            info!(server = %auth_server, "No authorization server metadata, using defaults");
            AuthServerMetadata::fallback(&auth_server)
        }
    };

    debug!(
        authorization_endpoint = %metadata.authorization_endpoint,
        token_endpoint = %metadata.token_endpoint,
        "Resolved OAuth endpoints"
    );
    Ok(metadata)
}

/// Register a client dynamically.
pub async fn register_client(
    http: &Client,
    registration_endpoint: &str,
    metadata: &ClientMetadata,
) -> AuthResult<ClientRegistration> {
    let response = http
        .post(registration_endpoint)
        .json(metadata)
        .send()
        .await
        .map_err(|e| AuthError::Registration(format!("Registration request failed: {e}")))?;

    let status = response.status();
    if status != StatusCode::OK && status != StatusCode::CREATED {
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::Registration(format!("{status}: {text}")));
    }

    let mut client: ClientRegistration = response
        .json()
        .await
        .map_err(|e| AuthError::Registration(format!("Invalid registration response: {e}")))?;

    if client.redirect_uris.is_empty() {
        client.redirect_uris = metadata.redirect_uris.clone();
    }
    if client.grant_types.is_empty() {
        client.grant_types = metadata.grant_types.clone();
    }
    if client.response_types.is_empty() {
        client.response_types = metadata.response_types.clone();
    }

    info!(client_id = %client.client_id, "Registered OAuth client");
    Ok(client)
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

async fn token_request(
    http: &Client,
    token_endpoint: &str,
    params: &[(&str, &str)],
) -> AuthResult<OAuthTokens> {
    let response = http
        .post(token_endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| AuthError::token_exchange(format!("Token request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(AuthError::token_exchange(format!("{status}: {text}")));
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::token_exchange(format!("Invalid token response: {e}")))
}

/// Exchange authorization code for tokens.
pub async fn exchange_code(
    http: &Client,
    token_endpoint: &str,
    client: &ClientRegistration,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client.client_id.as_str()),
        ("code_verifier", code_verifier),
    ];

    if let Some(ref secret) = client.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    token_request(http, token_endpoint, &params).await
}

/// Refresh tokens using refresh token.
pub async fn refresh_tokens(
    http: &Client,
    token_endpoint: &str,
    client: &ClientRegistration,
    refresh_token: &str,
) -> AuthResult<OAuthTokens> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client.client_id.as_str()),
    ];

    if let Some(ref secret) = client.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    token_request(http, token_endpoint, &params).await
}
