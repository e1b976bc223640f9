//! OAuth-authenticated Model Context Protocol (MCP) client for mcplink.
//!
//! Bootstraps a session against a remote MCP server that sits behind an
//! OAuth 2.0 authorization-code flow, then drives it from a small command
//! loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  redirect  ┌──────────────────┐
//! │   Browser    │───────────▶│ CallbackListener │
//! └──────────────┘            └────────┬─────────┘
//!        ▲                             │ outcome
//!        │ authorize URL      ┌────────▼─────────┐     ┌────────────┐
//!        └────────────────────│ AuthOrchestrator │────▶│ TokenStore │
//!                             └──────────────────┘     └─────┬──────┘
//!                                                            │ bearer
//! ┌─────────────────┐         ┌──────────────────┐     ┌─────▼──────┐
//! │ InteractiveLoop │────────▶│  SessionManager  │────▶│ MCP server │
//! └─────────────────┘         └──────────────────┘     └────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **Streamable HTTP**: POST per message at `/mcp`
//! - **SSE**: legacy event stream at `/sse`
//!
//! # Example
//!
//! ```no_run
//! use mcplink_client::{AuthConfig, AuthOrchestrator, SessionConfig, SessionManager, TokenStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session_config = SessionConfig::default();
//!
//! let auth = AuthOrchestrator::new(AuthConfig::default(), TokenStore::new())?;
//! let token = auth.authorize(&session_config.url).await?;
//!
//! let mut session = SessionManager::new();
//! session.open(&session_config, Some(&token.access_token)).await?;
//!
//! for tool in session.list_operations().await? {
//!     println!("{}", tool.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod authorize;
pub mod callback;
mod error;
mod http;
#[cfg(test)]
mod mock;
pub mod oauth;
pub mod protocol;
pub mod repl;
mod session;
pub mod sse;
mod store;
mod transport;

pub use authorize::{AuthConfig, AuthOrchestrator, BrowserLauncher, ManualBrowser, SystemBrowser};
pub use callback::{AuthorizationOutcome, CallbackListener};
pub use error::{AuthError, AuthResult, SessionError, SessionResult};
pub use http::StreamableHttpTransport;
pub use oauth::{ClientMetadata, ClientRegistration, OAuthTokens};
pub use protocol::{McpTool, ToolContent};
pub use repl::{Command, InputError, InteractiveLoop, LoopExit};
pub use session::{SessionConfig, SessionManager, ToolOutcome};
pub use sse::SseTransport;
pub use store::{TokenRecord, TokenStore};
pub use transport::{Transport, TransportConfig, TransportKind};
