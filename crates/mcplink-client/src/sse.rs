//! SSE (Server-Sent Events) support.
//!
//! Contains the incremental `text/event-stream` parser used by both HTTP
//! transports, and the legacy HTTP+SSE transport:
//! - one long-lived GET stream for server → client messages
//! - HTTP POST to the endpoint announced by the first `endpoint` event

use crate::error::{SessionError, SessionResult};
use crate::http::map_send_error;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::{Transport, TransportConfig};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    /// Event type (`event:` field); `None` means the default `message`.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// Last event id, if sent.
    pub id: Option<String>,
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Bytes are buffered until a blank line completes an event, so chunk
/// boundaries may fall anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: Vec<u8>,
}

impl EventParser {
    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data_lines.is_empty() && event.event.is_none() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Legacy HTTP+SSE transport.
pub struct SseTransport {
    config: TransportConfig,
    client: Client,
    /// Message endpoint announced by the server.
    endpoint: String,
    /// Requests waiting for their response event.
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the server's `endpoint` event.
    pub async fn connect(config: TransportConfig) -> SessionResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        // No overall timeout: the event stream stays open for the session.
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                SessionError::connection_failed(format!("Failed to create HTTP client: {e}"))
            })?;

        let base = Url::parse(&config.url)
            .map_err(|e| SessionError::connection_failed(format!("Invalid server URL: {e}")))?;

        let mut req = client.get(base.clone()).header("Accept", "text/event-stream");
        if let Some(ref token) = config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let response = req.send().await.map_err(map_send_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthRequired);
        }
        if !response.status().is_success() {
            return Err(SessionError::connection_failed(format!(
                "Event stream returned {}",
                response.status()
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = tokio::spawn(read_events(
            response,
            base,
            endpoint_tx,
            pending.clone(),
            connected.clone(),
        ));

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(SessionError::connection_failed(
                    "Event stream closed before announcing an endpoint",
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(SessionError::Timeout);
            }
        };

        info!(endpoint = %endpoint, "SSE transport connected");

        Ok(Self {
            config,
            client,
            endpoint,
            pending,
            connected,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }

    /// The message endpoint announced by the server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: String) -> SessionResult<()> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req.send().await.map_err(map_send_error)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthRequired);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SessionError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

/// Pump the event stream until it ends, routing responses to waiters.
async fn read_events(
    response: reqwest::Response,
    base: Url,
    endpoint_tx: oneshot::Sender<String>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = EventParser::default();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "SSE stream error");
                break;
            }
        };

        for event in parser.push(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") => match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url.to_string());
                        }
                    }
                    Err(e) => warn!(error = %e, data = %event.data, "Invalid endpoint event"),
                },
                None | Some("message") => dispatch(&event.data, &pending).await,
                Some(other) => debug!(event = other, "Ignoring SSE event"),
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().await.clear();
    debug!("SSE stream ended");
}

async fn dispatch(data: &str, pending: &PendingMap) {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Malformed SSE message");
            return;
        }
    };

    let is_response = value.get("id").is_some()
        && (value.get("result").is_some() || value.get("error").is_some());
    if !is_response {
        debug!(method = ?value.get("method"), "Ignoring server-initiated message");
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(response) => {
            if let Some(sender) = pending.lock().await.remove(&response.id) {
                let _ = sender.send(response);
            } else {
                debug!(id = response.id, "Response for unknown request");
            }
        }
        Err(e) => warn!(error = %e, "Unparseable JSON-RPC response"),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> SessionResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(SessionError::connection_failed("Event stream closed"));
        }
        let id = request
            .id
            .ok_or_else(|| SessionError::protocol_error("Request without id"))?;
        let body = serde_json::to_string(&request)?;

        debug!(id, method = %request.method, "Sending SSE request");

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.post(body).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SessionError::connection_failed(
                "Event stream closed before response",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> SessionResult<()> {
        debug!(method = %notification.method, "Sending SSE notification");
        self.post(serde_json::to_string(&notification)?).await
    }

    async fn close(&self) -> SessionResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        self.pending.lock().await.clear();
        debug!("Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}
