//! Authenticated MCP session.

use crate::error::{SessionError, SessionResult};
use crate::http::StreamableHttpTransport;
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsParams, ListToolsResult, McpTool, ToolCallResult, ToolContent,
};
use crate::sse::SseTransport;
use crate::transport::{Transport, TransportConfig, TransportKind};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where and how to reach the MCP server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full endpoint URL, including the transport path.
    pub url: String,
    pub transport: TransportKind,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl SessionConfig {
    /// Config for `host:port` with the conventional path for `transport`.
    pub fn new(host: &str, port: u16, transport: TransportKind) -> Self {
        Self {
            url: transport.endpoint(host, port),
            transport,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let transport = TransportKind::default();
        Self {
            url: transport.endpoint("localhost", 8000),
            transport,
            timeout_secs: 60,
        }
    }
}

/// Result of a tool invocation that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Ok { content: Vec<ToolContent> },
    /// The tool (or the server on its behalf) reported an error.
    Failed { message: String },
}

struct RemoteSession {
    transport: Arc<dyn Transport>,
    info: InitializeResult,
}

/// Owns the remote session and issues list/invoke calls over it.
pub struct SessionManager {
    session: Option<RemoteSession>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            session: None,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Connect to the configured endpoint and run the initialize handshake.
    pub async fn open(&mut self, config: &SessionConfig, token: Option<&str>) -> SessionResult<()> {
        info!(url = %config.url, transport = %config.transport, "Connecting to MCP server");

        let transport_config = TransportConfig {
            url: config.url.clone(),
            auth_token: token.map(str::to_string),
            timeout_secs: config.timeout_secs,
        };

        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::StreamableHttp => {
                Arc::new(StreamableHttpTransport::new(transport_config)?)
            }
            TransportKind::Sse => Arc::new(SseTransport::connect(transport_config).await?),
        };

        self.open_transport(transport).await
    }

    /// Run the initialize handshake over an already constructed transport.
    pub async fn open_transport(&mut self, transport: Arc<dyn Transport>) -> SessionResult<()> {
        if self.session.is_some() {
            self.close().await?;
        }

        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "initialize",
            Some(serde_json::to_value(InitializeParams::default())?),
        );
        let response = transport.request(request).await?;

        if let Some(error) = response.error {
            return Err(SessionError::InitializationFailed(error.message));
        }
        let info: InitializeResult = decode_result(response, "initialize")?;

        debug!(
            protocol_version = %info.protocol_version,
            server_name = %info.server_info.name,
            "MCP server initialized"
        );

        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        info!(server = %info.server_info.name, "MCP session established");
        self.session = Some(RemoteSession { transport, info });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// What the server reported during initialization.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Server-assigned session id, when the transport has one.
    pub async fn session_id(&self) -> Option<String> {
        match &self.session {
            Some(session) => session.transport.session_id().await,
            None => None,
        }
    }

    fn session(&self) -> SessionResult<&RemoteSession> {
        self.session.as_ref().ok_or(SessionError::NotConnected)
    }

    /// Every tool the server offers, in server order.
    pub async fn list_operations(&self) -> SessionResult<Vec<McpTool>> {
        let session = self.session()?;
        if session.info.capabilities.tools.is_none() {
            debug!("Server does not advertise tools");
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = ListToolsParams {
                cursor: cursor.clone(),
            };
            let request = JsonRpcRequest::new(
                self.next_request_id(),
                "tools/list",
                Some(serde_json::to_value(&params)?),
            );
            let response = session.transport.request(request).await?;

            if let Some(error) = response.error {
                return Err(SessionError::Remote {
                    method: "tools/list".to_string(),
                    code: error.code,
                    message: error.message,
                });
            }
            let page: ListToolsResult = decode_result(response, "tools/list")?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    warn!(cursor = %next, "Server repeated a pagination cursor");
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(tool_count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Call the tool `name` with a JSON object of arguments.
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> SessionResult<ToolOutcome> {
        let session = self.session()?;
        debug!(tool = name, "Calling MCP tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let request = JsonRpcRequest::new(
            self.next_request_id(),
            "tools/call",
            Some(serde_json::to_value(&params)?),
        );
        let response = session.transport.request(request).await?;

        if let Some(error) = response.error {
            return Ok(ToolOutcome::Failed {
                message: error.message,
            });
        }

        let result: ToolCallResult = decode_result(response, "tools/call")?;
        if result.is_error {
            let message = result
                .content
                .iter()
                .filter_map(ToolContent::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            let message = if message.is_empty() {
                format!("Tool '{name}' reported an error")
            } else {
                message
            };
            return Ok(ToolOutcome::Failed { message });
        }

        Ok(ToolOutcome::Ok {
            content: result.content,
        })
    }

    /// Close the transport. Safe to call when not open.
    pub async fn close(&mut self) -> SessionResult<()> {
        if let Some(session) = self.session.take() {
            session.transport.close().await?;
            info!("MCP session closed");
        }
        Ok(())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_result<T: DeserializeOwned>(response: JsonRpcResponse, method: &str) -> SessionResult<T> {
    let result = response
        .result
        .ok_or_else(|| SessionError::protocol_error(format!("Missing {method} result")))?;
    serde_json::from_value(result).map_err(|e| SessionError::protocol_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{failure, initialize_result, success, MockTransport};
    use serde_json::json;

    async fn open_with(transport: MockTransport) -> (SessionManager, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        let mut manager = SessionManager::new();
        manager.open_transport(transport.clone()).await.unwrap();
        (manager, transport)
    }

    fn echo_tools() -> MockTransport {
        MockTransport::with_tools(
            json!([
                { "name": "echo", "description": "Echo the input" },
                { "name": "add" },
            ]),
            |params| {
                if params["name"] == "fail" {
                    return Ok(success(
                        0,
                        json!({ "content": [{ "type": "text", "text": "boom" }], "isError": true }),
                    ));
                }
                if params["name"] == "missing" {
                    return Ok(failure(0, -32602, "Unknown tool: missing"));
                }
                let text = params["arguments"].to_string();
                Ok(success(0, json!({ "content": [{ "type": "text", "text": text }] })))
            },
        )
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.url, "http://localhost:8000/mcp");
        assert_eq!(config.transport, TransportKind::StreamableHttp);
    }

    #[test]
    fn test_session_config_sse() {
        let config = SessionConfig::new("example.com", 9000, TransportKind::Sse);
        assert_eq!(config.url, "http://example.com:9000/sse");
    }

    #[tokio::test]
    async fn test_not_connected_before_open() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.list_operations().await,
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            manager.invoke("echo", Map::new()).await,
            Err(SessionError::NotConnected)
        ));
        assert!(manager.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_open_runs_handshake() {
        let (manager, transport) = open_with(echo_tools()).await;
        assert!(manager.is_open());
        assert_eq!(transport.methods(), vec!["initialize"]);
        assert_eq!(
            *transport.notifications.lock().unwrap(),
            vec!["notifications/initialized".to_string()]
        );
        assert_eq!(manager.server_info().unwrap().server_info.name, "mock-server");
        assert_eq!(manager.session_id().await.as_deref(), Some("mock-session"));
    }

    #[tokio::test]
    async fn test_initialize_error_fails_open() {
        let transport = Arc::new(MockTransport::new(|request| {
            Ok(failure(request.id.unwrap_or_default(), -32600, "unsupported version"))
        }));
        let mut manager = SessionManager::new();
        let result = manager.open_transport(transport).await;
        assert!(matches!(result, Err(SessionError::InitializationFailed(ref m)) if m == "unsupported version"));
        assert!(!manager.is_open());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let config = SessionConfig {
            url: "http://127.0.0.1:1/mcp".to_string(),
            transport: TransportKind::StreamableHttp,
            timeout_secs: 1,
        };
        let mut manager = SessionManager::new();
        assert!(manager.open(&config, Some("token")).await.is_err());
        assert!(!manager.is_open());
    }

    #[tokio::test]
    async fn test_list_operations_in_order() {
        let (manager, _) = open_with(echo_tools()).await;
        let tools = manager.list_operations().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "add"]);
        assert_eq!(tools[0].description.as_deref(), Some("Echo the input"));
    }

    #[tokio::test]
    async fn test_list_operations_follows_cursor() {
        let transport = MockTransport::new(|request| {
            let id = request.id.unwrap_or_default();
            match request.method.as_str() {
                "initialize" => Ok(success(id, initialize_result(true))),
                _ => {
                    let cursor = request
                        .params
                        .as_ref()
                        .and_then(|p| p.get("cursor"))
                        .and_then(Value::as_str);
                    let page = match cursor {
                        None => json!({ "tools": [{ "name": "a" }], "nextCursor": "page2" }),
                        Some(_) => json!({ "tools": [{ "name": "b" }] }),
                    };
                    Ok(success(id, page))
                }
            }
        });
        let (manager, transport) = open_with(transport).await;

        let tools = manager.list_operations().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(transport.methods(), vec!["initialize", "tools/list", "tools/list"]);
    }

    #[tokio::test]
    async fn test_list_operations_without_tools_capability() {
        let transport = MockTransport::new(|request| {
            Ok(success(request.id.unwrap_or_default(), initialize_result(false)))
        });
        let (manager, transport) = open_with(transport).await;
        assert!(manager.list_operations().await.unwrap().is_empty());
        assert_eq!(transport.methods(), vec!["initialize"]);
    }

    #[tokio::test]
    async fn test_list_operations_remote_error() {
        let transport = MockTransport::new(|request| {
            let id = request.id.unwrap_or_default();
            match request.method.as_str() {
                "initialize" => Ok(success(id, initialize_result(true))),
                _ => Ok(failure(id, -32603, "registry offline")),
            }
        });
        let (manager, _) = open_with(transport).await;

        let err = manager.list_operations().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Remote { code: -32603, ref message, .. } if message == "registry offline"
        ));
        assert!(!err.is_connection_error());
        assert!(manager.is_open());
    }

    #[tokio::test]
    async fn test_invoke_passes_arguments() {
        let (manager, transport) = open_with(echo_tools()).await;

        let mut args = Map::new();
        args.insert("x".to_string(), json!(1));
        let outcome = manager.invoke("echo", args).await.unwrap();

        assert_eq!(
            outcome,
            ToolOutcome::Ok {
                content: vec![ToolContent::Text {
                    text: r#"{"x":1}"#.to_string()
                }]
            }
        );
        assert_eq!(
            transport.last_params(),
            Some(json!({ "name": "echo", "arguments": { "x": 1 } }))
        );
    }

    #[tokio::test]
    async fn test_invoke_application_errors() {
        let (manager, _) = open_with(echo_tools()).await;

        let outcome = manager.invoke("fail", Map::new()).await.unwrap();
        assert_eq!(
            outcome,
            ToolOutcome::Failed {
                message: "boom".to_string()
            }
        );

        let outcome = manager.invoke("missing", Map::new()).await.unwrap();
        assert_eq!(
            outcome,
            ToolOutcome::Failed {
                message: "Unknown tool: missing".to_string()
            }
        );

        // Session remains usable.
        assert!(manager.list_operations().await.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_transport_failure_is_session_error() {
        let transport = MockTransport::new(|request| match request.method.as_str() {
            "initialize" => Ok(success(request.id.unwrap_or_default(), initialize_result(true))),
            _ => Err(SessionError::connection_failed("reset by peer")),
        });
        let (manager, _) = open_with(transport).await;
        assert!(matches!(
            manager.invoke("echo", Map::new()).await,
            Err(SessionError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut manager, transport) = open_with(echo_tools()).await;
        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert!(!manager.is_open());
        assert!(!transport.is_connected());
        assert!(matches!(
            manager.list_operations().await,
            Err(SessionError::NotConnected)
        ));
    }
}
