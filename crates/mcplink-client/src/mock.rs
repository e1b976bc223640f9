//! Scripted transport for unit tests.

use crate::error::{SessionError, SessionResult};
use crate::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Handler = Box<dyn Fn(&JsonRpcRequest) -> SessionResult<JsonRpcResponse> + Send + Sync>;

/// Answers requests through a closure and records traffic.
pub(crate) struct MockTransport {
    handler: Handler,
    pub requests: Mutex<Vec<JsonRpcRequest>>,
    pub notifications: Mutex<Vec<String>>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new(
        handler: impl Fn(&JsonRpcRequest) -> SessionResult<JsonRpcResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// A server advertising tools that answers `tools/list` and `tools/call`.
    pub fn with_tools(
        tools: Value,
        call: impl Fn(&Value) -> SessionResult<JsonRpcResponse> + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |request| {
            let id = request.id.unwrap_or_default();
            match request.method.as_str() {
                "initialize" => Ok(success(id, initialize_result(true))),
                "tools/list" => Ok(success(id, json!({ "tools": tools.clone() }))),
                "tools/call" => call(request.params.as_ref().unwrap_or(&Value::Null)).map(|mut r| {
                    r.id = id;
                    r
                }),
                other => Err(SessionError::protocol_error(format!("unexpected {other}"))),
            }
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.method.clone())
            .collect()
    }

    pub fn last_params(&self) -> Option<Value> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|r| r.params.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: JsonRpcRequest) -> SessionResult<JsonRpcResponse> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(&request)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> SessionResult<()> {
        self.notifications.lock().unwrap().push(notification.method);
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn session_id(&self) -> Option<String> {
        Some("mock-session".to_string())
    }
}

pub(crate) fn success(id: u64, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: Some(result),
        error: None,
    }
}

pub(crate) fn failure(id: u64, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
    }
}

pub(crate) fn initialize_result(with_tools: bool) -> Value {
    let capabilities = if with_tools {
        json!({ "tools": {} })
    } else {
        json!({})
    };
    json!({
        "protocolVersion": "2025-03-26",
        "capabilities": capabilities,
        "serverInfo": { "name": "mock-server", "version": "1.0.0" },
    })
}
