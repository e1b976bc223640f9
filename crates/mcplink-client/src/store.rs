//! In-memory token storage.
//!
//! Tokens and the client registration live for the process lifetime only;
//! nothing is written to disk.

use crate::oauth::{ClientRegistration, OAuthTokens};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Tokens are treated as expired this many seconds before `expires_at`.
const EXPIRY_SKEW_SECS: u64 = 60;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A token as held by the store, with absolute expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp when token expires.
    pub expires_at: Option<u64>,
    pub scope: Option<String>,
}

impl TokenRecord {
    /// Convert a token endpoint response, anchoring `expires_in` at `now`.
    pub fn from_response(tokens: OAuthTokens, now: u64) -> Self {
        Self {
            access_token: tokens.access_token,
            token_type: tokens.token_type,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|exp| now.saturating_add(exp)),
            scope: tokens.scope,
        }
    }

    /// Whether the token is still usable at `now`.
    pub fn is_valid_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now.saturating_add(EXPIRY_SKEW_SECS),
            // No expiration = valid
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    tokens: Option<TokenRecord>,
    client: Option<ClientRegistration>,
}

/// Process-lifetime holder of the current token and client registration.
///
/// Cloning yields another handle to the same storage.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    state: Arc<RwLock<StoreState>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token record, valid or not.
    pub async fn tokens(&self) -> Option<TokenRecord> {
        self.state.read().await.tokens.clone()
    }

    /// Replace the stored token.
    pub async fn set_tokens(&self, tokens: TokenRecord) {
        self.state.write().await.tokens = Some(tokens);
        info!("Stored OAuth tokens");
    }

    /// Registered client, if any.
    pub async fn client_registration(&self) -> Option<ClientRegistration> {
        self.state.read().await.client.clone()
    }

    /// Replace the client registration.
    pub async fn set_client_registration(&self, client: ClientRegistration) {
        info!(client_id = %client.client_id, "Stored client registration");
        self.state.write().await.client = Some(client);
    }

    /// The access token if one is stored and not about to expire.
    pub async fn access_token(&self) -> Option<String> {
        let now = unix_now();
        let state = self.state.read().await;
        state
            .tokens
            .as_ref()
            .filter(|t| t.is_valid_at(now))
            .map(|t| t.access_token.clone())
    }
}
