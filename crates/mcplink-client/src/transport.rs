//! MCP transport abstraction.

use crate::error::SessionResult;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for a response.
    async fn request(&self, request: JsonRpcRequest) -> SessionResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> SessionResult<()>;

    /// Close the transport.
    async fn close(&self) -> SessionResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Server-assigned session identifier, if the transport has one.
    async fn session_id(&self) -> Option<String> {
        None
    }
}

/// Settings shared by the HTTP-based transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The endpoint URL (e.g., `http://localhost:8000/mcp`)
    pub url: String,
    /// Optional bearer token
    pub auth_token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: None,
            timeout_secs: 60,
        }
    }
}

/// Which wire variant to speak to the remote endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Streamable HTTP: POST per message, JSON or SSE responses.
    #[default]
    StreamableHttp,
    /// Legacy HTTP+SSE: one GET event stream plus a POST endpoint.
    Sse,
}

impl TransportKind {
    /// Path suffix the server mounts this transport under.
    pub fn path(&self) -> &'static str {
        match self {
            Self::StreamableHttp => "/mcp",
            Self::Sse => "/sse",
        }
    }

    /// Build the endpoint URL for `host:port`.
    pub fn endpoint(&self, host: &str, port: u16) -> String {
        format!("http://{host}:{port}{}", self.path())
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamableHttp => write!(f, "streamable-http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streamable-http" | "http" => Ok(Self::StreamableHttp),
            "sse" => Ok(Self::Sse),
            other => Err(format!(
                "unsupported transport '{other}' (expected 'streamable-http' or 'sse')"
            )),
        }
    }
}
