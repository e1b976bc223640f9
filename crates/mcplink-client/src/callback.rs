//! Loopback listener for OAuth redirects.
//!
//! Runs a tiny HTTP responder on its own task and captures the first
//! terminal redirect (an authorization code or an error) into a
//! single-assignment slot the orchestrator waits on.

use crate::error::{AuthError, AuthResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default callback host.
pub const DEFAULT_CALLBACK_HOST: &str = "localhost";

/// Default callback port.
pub const DEFAULT_CALLBACK_PORT: u16 = 3030;

/// Default callback path advertised in the redirect URI.
pub const DEFAULT_CALLBACK_PATH: &str = "/callback";

/// How long `stop()` waits for the accept task before aborting it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a single connection may take to send its request head.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_REQUEST_BYTES: usize = 8192;

/// HTML response for successful authorization.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>mcplink - Authorization Successful</title>
  <style>
    body { font-family: system-ui, sans-serif; text-align: center; margin-top: 15vh; }
    h1 { color: #16a34a; }
  </style>
</head>
<body>
  <h1>Authorization Successful!</h1>
  <p>You can close this window and return to the terminal.</p>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

/// HTML response for failed authorization.
fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>mcplink - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, sans-serif; text-align: center; margin-top: 15vh; }}
    h1 {{ color: #dc2626; }}
    .error {{ font-family: monospace; }}
  </style>
</head>
<body>
  <h1>Authorization Failed</h1>
  <p class="error">Error: {}</p>
  <p>You can close this window and return to the terminal.</p>
</body>
</html>"#,
        html_escape(error)
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

/// Terminal result of one authorization redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// The user approved; the code still has to be exchanged.
    Code { code: String, state: Option<String> },
    /// The authorization server reported an error.
    Error {
        error: String,
        description: Option<String>,
    },
}

impl AuthorizationOutcome {
    /// Interpret redirect query parameters. `code` takes precedence over `error`.
    pub fn from_query(params: &HashMap<String, String>) -> Option<Self> {
        if let Some(code) = params.get("code") {
            return Some(Self::Code {
                code: code.clone(),
                state: params.get("state").cloned(),
            });
        }
        params.get("error").map(|error| Self::Error {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        })
    }
}

type OutcomeSlot = Arc<watch::Sender<Option<AuthorizationOutcome>>>;

/// Store `outcome` unless the slot is already filled. Returns whether it was stored.
fn record(slot: &OutcomeSlot, outcome: AuthorizationOutcome) -> bool {
    slot.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    })
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Background HTTP responder capturing one OAuth redirect.
///
/// One listener serves one authorization attempt. `stop()` is idempotent
/// and may be called whether or not `start()` ever succeeded; dropping the
/// listener also signals its task to shut down.
pub struct CallbackListener {
    host: String,
    port: u16,
    path: String,
    /// Single-assignment outcome slot shared with connection handlers.
    outcome: OutcomeSlot,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
}

impl CallbackListener {
    /// Create a listener for `host:port`. Port 0 picks an ephemeral port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            host: host.into(),
            port,
            path: DEFAULT_CALLBACK_PATH.to_string(),
            outcome: Arc::new(outcome),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the path used in the redirect URI.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Bind the socket and start serving on a background task.
    pub async fn start(&self) -> AuthResult<SocketAddr> {
        if self.is_listening() {
            if let Some(addr) = self.local_addr() {
                return Ok(addr);
            }
        }

        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                AuthError::listener_unavailable(format!(
                    "Failed to bind {}:{}: {e}",
                    self.host, self.port
                ))
            })?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::listener_unavailable(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.running.store(true, Ordering::SeqCst);
        let task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            self.outcome.clone(),
            self.running.clone(),
        ));

        *self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        info!(addr = %addr, "OAuth callback listener started");
        Ok(addr)
    }

    /// Stop serving and release the socket.
    pub async fn stop(&self) {
        if let Some(sender) = take(&self.shutdown_tx) {
            let _ = sender.send(());
        }

        if let Some(task) = take(&self.task) {
            let abort = task.abort_handle();
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, task).await {
                Ok(_) => info!("OAuth callback listener stopped"),
                Err(_) => {
                    warn!("OAuth callback listener did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the accept loop is alive.
    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Redirect URI pointing at this listener.
    pub fn redirect_uri(&self) -> String {
        let port = self.local_addr().map_or(self.port, |addr| addr.port());
        format!("http://{}:{}{}", self.host, port, self.path)
    }

    /// Snapshot of the outcome slot.
    pub fn outcome(&self) -> Option<AuthorizationOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until a terminal outcome is recorded, or `timeout` elapses.
    pub async fn wait_for_outcome(&self, timeout: Duration) -> AuthResult<AuthorizationOutcome> {
        info!(timeout_secs = timeout.as_secs(), "Waiting for authorization callback");
        let mut rx = self.outcome.subscribe();

        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(slot)) => (*slot)
                .clone()
                .ok_or_else(|| AuthError::listener_unavailable("Outcome slot emptied")),
            Ok(Err(_)) => Err(AuthError::listener_unavailable("Outcome slot closed")),
            Err(_) => Err(AuthError::Timeout(timeout)),
        };
        result
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(sender) = take(&self.shutdown_tx) {
            let _ = sender.send(());
        }
        if let Some(task) = take(&self.task) {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    outcome: OutcomeSlot,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let outcome = outcome.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, outcome).await {
                                warn!(peer = %peer, error = %e, "Error handling OAuth callback");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Error accepting connection");
                    }
                }
            }
            _ = &mut shutdown_rx => {
                debug!("OAuth callback listener shutting down");
                break;
            }
        }
    }

    // The listener is dropped here, releasing the port.
    running.store(false, Ordering::SeqCst);
}

/// Read the request head, up to the blank line or the size limit.
async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Handle an incoming HTTP connection.
async fn handle_connection(mut stream: TcpStream, outcome: OutcomeSlot) -> std::io::Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request_head(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => {
            debug!("Callback connection timed out before sending a request");
            return Ok(());
        }
    };

    let response = respond(&request, &outcome);
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

/// Build the HTTP response for a raw request, recording any outcome it carries.
fn respond(request: &str, outcome: &OutcomeSlot) -> String {
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();

    if parts.len() < 2 {
        return http_response(400, "text/plain", "Bad Request");
    }
    if parts[0] != "GET" {
        return http_response(405, "text/plain", "Method Not Allowed");
    }

    let parsed = match url::Url::parse(&format!("http://127.0.0.1{}", parts[1])) {
        Ok(u) => u,
        Err(_) => return http_response(400, "text/plain", "Invalid URL"),
    };

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let Some(received) = AuthorizationOutcome::from_query(&params) else {
        return http_response(404, "text/plain", "Not Found");
    };

    let (status, body) = match &received {
        AuthorizationOutcome::Code { .. } => (200, HTML_SUCCESS.to_string()),
        AuthorizationOutcome::Error { error, .. } => (400, html_error(error)),
    };

    if record(outcome, received) {
        debug!(path = parsed.path(), status, "Recorded authorization outcome");
    } else {
        debug!(path = parsed.path(), "Ignoring redirect, outcome already recorded");
    }

    http_response(status, "text/html", &body)
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
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
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

    fn slot() -> OutcomeSlot {
        Arc::new(watch::channel(None).0)
    }

    fn status_of(response: &str) -> u16 {
        response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap()
    }

    async fn get(addr: SocketAddr, target: &str) -> reqwest::Response {
        reqwest::get(format!("http://{addr}{target}")).await.unwrap()
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("a & b"), "a &amp; b");
        assert_eq!(html_escape("it's \"quoted\""), "it&#39;s &quot;quoted&quot;");
    }

    #[test]
    fn test_html_error_with_special_chars() {
        let html = html_error("<script>alert('xss')</script>");
        assert!(html.contains("Authorization Failed"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>alert"));
    }

    #[test]
    fn test_outcome_from_query() {
        let params: HashMap<String, String> = [("code", "ABC123"), ("state", "xyz")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(
            AuthorizationOutcome::from_query(&params),
            Some(AuthorizationOutcome::Code {
                code: "ABC123".to_string(),
                state: Some("xyz".to_string()),
            })
        );

        let params = HashMap::from([("error".to_string(), "access_denied".to_string())]);
        assert_eq!(
            AuthorizationOutcome::from_query(&params),
            Some(AuthorizationOutcome::Error {
                error: "access_denied".to_string(),
                description: None,
            })
        );

        let params = HashMap::from([("foo".to_string(), "bar".to_string())]);
        assert_eq!(AuthorizationOutcome::from_query(&params), None);
    }

    #[test]
    fn test_respond_statuses() {
        let outcome = slot();
        assert_eq!(status_of(&respond("GET /callback?foo=1 HTTP/1.1\r\n", &outcome)), 404);
        assert!(outcome.borrow().is_none());

        assert_eq!(status_of(&respond("POST /callback?code=a HTTP/1.1\r\n", &outcome)), 405);
        assert_eq!(status_of(&respond("garbage", &outcome)), 400);
        assert!(outcome.borrow().is_none());

        let response = respond("GET /callback?code=ABC123&state=xyz HTTP/1.1\r\n", &outcome);
        assert_eq!(status_of(&response), 200);
        assert!(response.contains("Authorization Successful"));
    }

    #[test]
    fn test_first_writer_wins() {
        let outcome = slot();
        respond("GET /callback?code=first&state=s1 HTTP/1.1\r\n", &outcome);

        let response = respond("GET /callback?error=access_denied HTTP/1.1\r\n", &outcome);
        assert_eq!(status_of(&response), 400);
        respond("GET /callback?code=second&state=s2 HTTP/1.1\r\n", &outcome);

        assert_eq!(
            *outcome.borrow(),
            Some(AuthorizationOutcome::Code {
                code: "first".to_string(),
                state: Some("s1".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let listener = CallbackListener::new("127.0.0.1", 0);
        listener.stop().await;
        listener.stop().await;
        assert!(!listener.is_listening());
        assert!(listener.outcome().is_none());
    }

    #[tokio::test]
    async fn test_redirect_with_code() {
        let listener = CallbackListener::new("127.0.0.1", 0);
        let addr = listener.start().await.unwrap();
        assert!(listener.is_listening());

        let response = get(addr, "/callback?code=ABC123&state=xyz").await;
        assert_eq!(response.status().as_u16(), 200);
        assert!(response.text().await.unwrap().contains("close this window"));

        assert_eq!(
            listener.outcome(),
            Some(AuthorizationOutcome::Code {
                code: "ABC123".to_string(),
                state: Some("xyz".to_string()),
            })
        );

        listener.stop().await;
        listener.stop().await;
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn test_redirect_with_error() {
        let listener = CallbackListener::new("127.0.0.1", 0);
        let addr = listener.start().await.unwrap();

        let response = get(addr, "/callback?error=access_denied").await;
        assert_eq!(response.status().as_u16(), 400);
        assert!(response.text().await.unwrap().contains("access_denied"));

        let outcome = listener.wait_for_outcome(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            outcome,
            AuthorizationOutcome::Error {
                error: "access_denied".to_string(),
                description: None,
            }
        );
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_unrecognized_redirect_keeps_listening() {
        let listener = CallbackListener::new("127.0.0.1", 0);
        let addr = listener.start().await.unwrap();

        let response = get(addr, "/favicon.ico").await;
        assert_eq!(response.status().as_u16(), 404);
        assert!(listener.outcome().is_none());

        let response = get(addr, "/callback?code=late").await;
        assert_eq!(response.status().as_u16(), 200);
        assert!(matches!(
            listener.outcome(),
            Some(AuthorizationOutcome::Code { state: None, .. })
        ));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_wait_times_out_and_port_is_released() {
        let listener = CallbackListener::new("127.0.0.1", 0);
        let addr = listener.start().await.unwrap();

        let result = listener.wait_for_outcome(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(AuthError::Timeout(_))));

        listener.stop().await;
        assert!(!listener.is_listening());
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_redirect() {
        let listener = Arc::new(CallbackListener::new("127.0.0.1", 0));
        let addr = listener.start().await.unwrap();

        let waiter = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.wait_for_outcome(Duration::from_secs(5)).await })
        };

        get(addr, "/callback?code=ABC123&state=xyz").await;
        let outcome = waiter.await.unwrap().unwrap();
        assert!(matches!(outcome, AuthorizationOutcome::Code { code, .. } if code == "ABC123"));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_listener_unavailable() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let listener = CallbackListener::new("127.0.0.1", port);
        let result = listener.start().await;
        assert!(matches!(result, Err(AuthError::ListenerUnavailable(_))));
        assert!(!listener.is_listening());

        // Stopping after a failed start is harmless.
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_redirect_uri_uses_bound_port() {
        let listener = CallbackListener::new("localhost", 0).with_path("/oauth/callback");
        assert_eq!(listener.redirect_uri(), "http://localhost:0/oauth/callback");

        let listener = CallbackListener::new("127.0.0.1", 0);
        let addr = listener.start().await.unwrap();
        assert_eq!(
            listener.redirect_uri(),
            format!("http://127.0.0.1:{}/callback", addr.port())
        );
        listener.stop().await;
    }
}
