//! Streamable HTTP transport for remote MCP servers.
//!
//! Every message is an HTTP POST to the endpoint; the server answers either
//! with a plain JSON body or with an SSE stream carrying the response.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::EventParser;
use crate::transport::{Transport, TransportConfig};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Map a reqwest send failure onto the session error taxonomy.
pub(crate) fn map_send_error(e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::Timeout
    } else if e.is_connect() {
        SessionError::connection_failed(format!("Connection failed: {e}"))
    } else {
        SessionError::protocol_error(format!("Request failed: {e}"))
    }
}

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    config: TransportConfig,
    client: Client,
    connected: AtomicBool,
    /// Cached session ID from server
    session_id: RwLock<Option<String>>,
}

impl StreamableHttpTransport {
    /// Create a new streamable HTTP transport.
    pub fn new(config: TransportConfig) -> SessionResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                SessionError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Build request with common headers.
    async fn build_request(&self, body: String) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);

        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(ref id) = *self.session_id.read().await {
            req = req.header(SESSION_ID_HEADER, id.as_str());
        }

        req
    }

    /// Parse the response to a request with the given id.
    async fn parse_response(
        &self,
        response: reqwest::Response,
        id: Option<u64>,
    ) -> SessionResult<JsonRpcResponse> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthRequired);
        }

        if status == StatusCode::NOT_FOUND && self.session_id.read().await.is_some() {
            return Err(SessionError::connection_failed("Session expired on server"));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SessionError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if content_type.contains("text/event-stream") {
            self.parse_sse_stream(response, id).await
        } else {
            let text = response.text().await.map_err(|e| {
                SessionError::protocol_error(format!("Failed to read response: {e}"))
            })?;

            let response: JsonRpcResponse = serde_json::from_str(&text).map_err(|e| {
                SessionError::protocol_error(format!("Invalid JSON response: {e}"))
            })?;
            match id {
                Some(id) if id != response.id => Err(SessionError::protocol_error(format!(
                    "Response id {} does not match request id {id}",
                    response.id
                ))),
                _ => Ok(response),
            }
        }
    }

    /// Read an SSE response stream until the matching JSON-RPC response arrives.
    async fn parse_sse_stream(
        &self,
        response: reqwest::Response,
        id: Option<u64>,
    ) -> SessionResult<JsonRpcResponse> {
        use futures::StreamExt;

        let mut stream = response.bytes_stream();
        let mut parser = EventParser::default();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result
                .map_err(|e| SessionError::connection_failed(format!("Stream error: {e}")))?;

            for event in parser.push(&chunk) {
                // Server requests and notifications interleave with the answer.
                match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(response) if id.map_or(true, |id| id == response.id) => {
                        return Ok(response)
                    }
                    _ => debug!(event = ?event.event, "Skipping unrelated SSE message"),
                }
            }
        }

        Err(SessionError::protocol_error(
            "SSE stream ended without response",
        ))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> SessionResult<JsonRpcResponse> {
        let request_json = serde_json::to_string(&request)?;

        debug!(id = request.id, method = %request.method, "Sending HTTP request");

        let response = self
            .build_request(request_json)
            .await
            .send()
            .await
            .map_err(map_send_error)?;

        if let Some(session_id) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write().await = Some(id.to_string());
            }
        }

        let parsed = self.parse_response(response, request.id).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(parsed)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> SessionResult<()> {
        let notification_json = serde_json::to_string(&notification)?;

        debug!(method = %notification.method, "Sending HTTP notification");

        let response = self
            .build_request(notification_json)
            .await
            .send()
            .await
            .map_err(map_send_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthRequired);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification returned non-success status");
        }

        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Servers without session support answer 405; that is fine.
        if let Some(id) = self.session_id.write().await.take() {
            let mut req = self
                .client
                .delete(&self.config.url)
                .header(SESSION_ID_HEADER, id);
            if let Some(ref token) = self.config.auth_token {
                req = req.header("Authorization", format!("Bearer {token}"));
            }
            if let Err(e) = req.send().await {
                debug!(error = %e, "Session termination request failed");
            }
        }

        debug!("Closed HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }
}
