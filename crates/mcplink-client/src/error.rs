//! Error types for the authorization and session phases.

use std::time::Duration;
use thiserror::Error;

/// Result type for authorization operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Result type for MCP session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that end an authorization attempt.
///
/// None of these are retried automatically; the caller decides whether to
/// run the whole flow again.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The local callback listener could not bind its port.
    #[error("Callback listener unavailable: {0}")]
    ListenerUnavailable(String),

    /// The authorization server redirected back with an `error` parameter.
    #[error("Authorization denied: {0}")]
    OAuthDenied(String),

    /// No redirect arrived within the configured window.
    #[error("Timed out after {}s waiting for the authorization callback", .0.as_secs())]
    Timeout(Duration),

    /// The wait was cancelled from outside (e.g. Ctrl-C).
    #[error("Authorization cancelled")]
    Cancelled,

    /// The `state` parameter of the redirect did not match the request.
    #[error("OAuth state mismatch - possible CSRF attempt")]
    StateMismatch,

    /// Authorization server metadata could not be resolved.
    #[error("OAuth discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration failed.
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// The token endpoint rejected the code or refresh token.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Create a listener-unavailable error.
    pub fn listener_unavailable(message: impl Into<String>) -> Self {
        Self::ListenerUnavailable(message.into())
    }

    /// Create a token exchange error.
    pub fn token_exchange(message: impl Into<String>) -> Self {
        Self::TokenExchange(message.into())
    }
}

/// Errors raised while opening or using the remote session.
///
/// [`SessionError::is_connection_error`] separates failures that leave the
/// session unusable from errors the server reported about one request.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An operation was attempted before `open` succeeded.
    #[error("Not connected to server")]
    NotConnected,

    /// Connection failed or was lost.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server violated the protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The server answered with a JSON-RPC error.
    #[error("{method} failed ({code}): {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },

    /// Server initialization failed.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// The server rejected the bearer token.
    #[error("Authentication required")]
    AuthRequired,

    /// Server timeout.
    #[error("Server timeout")]
    Timeout,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SessionError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Whether the transport itself failed and the session cannot continue.
    pub fn is_connection_error(&self) -> bool {
        !matches!(
            self,
            Self::Remote { .. } | Self::ProtocolError(_) | Self::Json(_)
        )
    }
}
