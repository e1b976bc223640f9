//! Authorization-code flow against an MCP server's OAuth provider.
//!
//! The orchestrator owns one [`CallbackListener`] per attempt and stops it
//! on every exit path, including panics in the flow itself.

use crate::callback::{
    AuthorizationOutcome, CallbackListener, DEFAULT_CALLBACK_HOST, DEFAULT_CALLBACK_PATH,
    DEFAULT_CALLBACK_PORT,
};
use crate::error::{AuthError, AuthResult};
use crate::oauth::{
    build_auth_url, discover_metadata, exchange_code, refresh_tokens, register_client,
    AuthServerMetadata, ClientMetadata, ClientRegistration, PkceChallenge,
};
use crate::store::{unix_now, TokenRecord, TokenStore};
use futures::FutureExt;
use reqwest::Client;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time to wait for the user to finish in the browser.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Default `client_name` used for dynamic registration.
pub const DEFAULT_CLIENT_NAME: &str = "mcplink";

/// Timeout for individual OAuth HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Authorization settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Host the callback listener binds and advertises.
    pub callback_host: String,
    /// Callback port. 0 binds an ephemeral port.
    pub callback_port: u16,
    /// Path advertised in the redirect URI.
    pub callback_path: String,
    /// How long to wait for the redirect.
    pub timeout: Duration,
    /// Name sent during dynamic registration.
    pub client_name: String,
    /// Requested scope.
    pub scope: Option<String>,
    /// Pre-registered client; skips dynamic registration.
    pub client: Option<ClientRegistration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            callback_host: DEFAULT_CALLBACK_HOST.to_string(),
            callback_port: DEFAULT_CALLBACK_PORT,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            timeout: DEFAULT_AUTH_TIMEOUT,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            scope: None,
            client: None,
        }
    }
}

impl AuthConfig {
    /// Redirect URI for the configured callback address.
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.callback_host, self.callback_port, self.callback_path
        )
    }
}

/// Sends the user to the authorization URL.
pub trait BrowserLauncher: Send + Sync {
    /// Present `url` to the user. An error makes the orchestrator print the URL instead.
    fn request_user_authorization(&self, url: &str) -> std::io::Result<()>;
}

/// Opens the URL in the system's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn request_user_authorization(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Prints the URL for the user to open by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualBrowser;

impl BrowserLauncher for ManualBrowser {
    fn request_user_authorization(&self, url: &str) -> std::io::Result<()> {
        print_manual_url(url);
        Ok(())
    }
}

fn print_manual_url(url: &str) {
    eprintln!("\nOpen this URL in your browser to authorize:\n\n  {url}\n");
}

/// Drives the authorization-code flow and keeps the [`TokenStore`] current.
pub struct AuthOrchestrator {
    config: AuthConfig,
    store: TokenStore,
    http: Client,
    browser: Arc<dyn BrowserLauncher>,
    cancel: Mutex<CancellationToken>,
}

impl AuthOrchestrator {
    /// Create an orchestrator that opens the system browser.
    pub fn new(config: AuthConfig, store: TokenStore) -> AuthResult<Self> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            store,
            http,
            browser: Arc::new(SystemBrowser),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Replace the browser launcher.
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Token that aborts a pending authorization wait when cancelled.
    ///
    /// A cancelled token is retired once the attempt it stopped returns, so
    /// later attempts need a fresh token from this method.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn retire_cancelled_token(&self) {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    /// Registration metadata for the configured client.
    pub fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata::new(&self.config.client_name, self.config.redirect_uri())
            .with_scope(self.config.scope.clone())
    }

    /// Return a usable token: the stored one, a refreshed one, or a new grant.
    pub async fn authorize(&self, server_url: &str) -> AuthResult<TokenRecord> {
        if let Some(tokens) = self.store.tokens().await {
            if tokens.is_valid_at(unix_now()) {
                debug!("Using stored access token");
                return Ok(tokens);
            }

            if let Some(refresh_token) = tokens.refresh_token.as_deref() {
                match self.refresh(server_url, refresh_token).await {
                    Ok(record) => return Ok(record),
                    Err(e) => warn!(error = %e, "Token refresh failed, re-authorizing"),
                }
            }
        }

        self.acquire_authorization(server_url, self.client_metadata(), self.config.timeout)
            .await
    }

    /// Run one interactive authorization attempt.
    ///
    /// The callback listener is stopped before this returns, whatever the
    /// outcome. A panic inside the flow is re-raised after the listener stops.
    pub async fn acquire_authorization(
        &self,
        server_url: &str,
        client_metadata: ClientMetadata,
        timeout: Duration,
    ) -> AuthResult<TokenRecord> {
        let listener = CallbackListener::new(&self.config.callback_host, self.config.callback_port)
            .with_path(&self.config.callback_path);

        if let Err(e) = listener.start().await {
            listener.stop().await;
            return Err(e);
        }

        let cancel = self.cancellation_token();
        let result = AssertUnwindSafe(self.run_flow(
            &listener,
            &cancel,
            server_url,
            client_metadata,
            timeout,
        ))
        .catch_unwind()
        .await;

        listener.stop().await;
        if cancel.is_cancelled() {
            self.retire_cancelled_token();
        }

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_flow(
        &self,
        listener: &CallbackListener,
        cancel: &CancellationToken,
        server_url: &str,
        mut client_metadata: ClientMetadata,
        timeout: Duration,
    ) -> AuthResult<TokenRecord> {
        // The bound listener decides the redirect URI.
        let redirect_uri = listener.redirect_uri();
        if client_metadata.redirect_uri() != Some(redirect_uri.as_str()) {
            client_metadata.redirect_uris = vec![redirect_uri.clone()];
        }

        let metadata = discover_metadata(&self.http, server_url).await?;
        let client = self.client_registration(&metadata, &client_metadata).await?;

        let pkce = PkceChallenge::generate();
        let auth_url = build_auth_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            &redirect_uri,
            client_metadata.scope.as_deref(),
            &pkce.state,
            &pkce.challenge,
        );

        info!(redirect_uri = %redirect_uri, "Opening browser for authorization");
        if let Err(e) = self.browser.request_user_authorization(&auth_url) {
            warn!(error = %e, "Failed to open browser");
            print_manual_url(&auth_url);
        }

        let outcome = tokio::select! {
            outcome = listener.wait_for_outcome(timeout) => outcome?,
            _ = cancel.cancelled() => {
                info!("Authorization cancelled");
                return Err(AuthError::Cancelled);
            }
        };

        let code = match outcome {
            AuthorizationOutcome::Code { code, state } => {
                if state.as_deref() != Some(pkce.state.as_str()) {
                    return Err(AuthError::StateMismatch);
                }
                code
            }
            AuthorizationOutcome::Error { error, description } => {
                let message = match description {
                    Some(description) => format!("{error}: {description}"),
                    None => error,
                };
                return Err(AuthError::OAuthDenied(message));
            }
        };

        info!("Received authorization code, exchanging for tokens");
        let tokens = exchange_code(
            &self.http,
            &metadata.token_endpoint,
            &client,
            &code,
            &redirect_uri,
            &pkce.verifier,
        )
        .await?;

        let record = TokenRecord::from_response(tokens, unix_now());
        self.store.set_tokens(record.clone()).await;
        info!("Authorization complete");
        Ok(record)
    }

    /// Refresh the stored token and commit the result.
    async fn refresh(&self, server_url: &str, refresh_token: &str) -> AuthResult<TokenRecord> {
        let metadata = discover_metadata(&self.http, server_url).await?;
        let client = match self.store.client_registration().await {
            Some(client) => client,
            None => self
                .config
                .client
                .clone()
                .ok_or_else(|| AuthError::token_exchange("No client registration for refresh"))?,
        };

        info!("Refreshing access token");
        let tokens =
            refresh_tokens(&self.http, &metadata.token_endpoint, &client, refresh_token).await?;

        let mut record = TokenRecord::from_response(tokens, unix_now());
        // Servers may omit the refresh token when it is not rotated.
        if record.refresh_token.is_none() {
            record.refresh_token = Some(refresh_token.to_string());
        }
        self.store.set_tokens(record.clone()).await;
        Ok(record)
    }

    /// Stored or configured client, registering a new one if needed.
    async fn client_registration(
        &self,
        metadata: &AuthServerMetadata,
        client_metadata: &ClientMetadata,
    ) -> AuthResult<ClientRegistration> {
        if let Some(client) = self.store.client_registration().await {
            if !client.is_expired_at(unix_now()) {
                return Ok(client);
            }
            info!(client_id = %client.client_id, "Client secret expired, registering again");
        }

        if let Some(client) = &self.config.client {
            self.store.set_client_registration(client.clone()).await;
            return Ok(client.clone());
        }

        let endpoint = metadata.registration_endpoint.as_deref().ok_or_else(|| {
            AuthError::Registration("Server does not support dynamic client registration".into())
        })?;
        let client = register_client(&self.http, endpoint, client_metadata).await?;
        self.store.set_client_registration(client.clone()).await;
        Ok(client)
    }
}
