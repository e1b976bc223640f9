//! mcplink - interactive MCP client with OAuth authorization.

use anyhow::Context;
use clap::Parser;
use mcplink_client::{
    AuthConfig, AuthOrchestrator, ClientRegistration, InteractiveLoop, LoopExit, ManualBrowser,
    SessionConfig, SessionManager, TokenStore, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcplink")]
#[command(author, version, about = "Interactive MCP client with OAuth authorization", long_about = None)]
struct Cli {
    /// MCP server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MCP server port
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Transport to use (streamable-http or sse)
    #[arg(long, env = "TRANSPORT", default_value = "streamable-http")]
    transport: TransportKind,

    /// Host for the OAuth callback listener
    #[arg(long, default_value = "localhost")]
    cb_host: String,

    /// Port for the OAuth callback listener
    #[arg(long, env = "CB_PORT", default_value_t = 3030)]
    cb_port: u16,

    /// Seconds to wait for authorization in the browser
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Client name sent during dynamic registration
    #[arg(long, default_value = "mcplink")]
    client_name: String,

    /// OAuth scope to request
    #[arg(long)]
    scope: Option<String>,

    /// Pre-registered OAuth client id (skips dynamic registration)
    #[arg(long, env = "MCPLINK_CLIENT_ID")]
    client_id: Option<String>,

    /// Secret for the pre-registered client
    #[arg(
        long,
        env = "MCPLINK_CLIENT_SECRET",
        requires = "client_id",
        hide_env_values = true
    )]
    client_secret: Option<String>,

    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn auth_config(&self) -> AuthConfig {
        let client = self.client_id.as_ref().map(|id| {
            let mut client = ClientRegistration::new(id.as_str());
            client.client_secret = self.client_secret.clone();
            client
        });

        AuthConfig {
            callback_host: self.cb_host.clone(),
            callback_port: self.cb_port,
            timeout: Duration::from_secs(self.timeout),
            client_name: self.client_name.clone(),
            scope: self.scope.clone(),
            client,
            ..AuthConfig::default()
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(&self.host, self.port, self.transport)
    }
}

/// Initialize logging to stderr; stdout belongs to the command loop.
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "mcplink=debug,mcplink_client=debug"
    } else {
        "mcplink=info,mcplink_client=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let session_config = cli.session_config();

    let mut auth = AuthOrchestrator::new(cli.auth_config(), TokenStore::new())?;
    if cli.no_browser {
        auth = auth.with_browser(Arc::new(ManualBrowser));
    }

    println!(
        "Connecting to {} ({})",
        session_config.url, session_config.transport
    );

    // Ctrl-C while waiting for the browser cancels the attempt.
    let cancel = auth.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let token = auth.authorize(&session_config.url).await;
    interrupt.abort();
    let token = token.context("Authorization failed")?;
    debug!(token_type = %token.token_type, "Obtained access token");

    let mut session = SessionManager::new();
    session
        .open(&session_config, Some(&token.access_token))
        .await
        .with_context(|| format!("Failed to open MCP session at {}", session_config.url))?;

    match session.session_id().await {
        Some(id) => println!("Session ID: {id}"),
        None => println!("Connected (server did not assign a session id)"),
    }

    let exit = {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut repl = InteractiveLoop::new(&session, stdin, tokio::io::stdout());
        tokio::select! {
            exit = repl.run() => exit?,
            _ = tokio::signal::ctrl_c() => LoopExit::Quit,
        }
    };

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close MCP session");
    }

    match exit {
        LoopExit::ConnectionLost(e) => {
            Err(anyhow::Error::new(e).context("Connection to the MCP server was lost"))
        }
        LoopExit::Quit | LoopExit::EndOfInput => {
            println!("Goodbye.");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_explicit_arguments() {
        let cli = Cli::try_parse_from([
            "mcplink",
            "--host",
            "mcp.example.com",
            "--port",
            "9000",
            "--transport",
            "sse",
            "--cb-port",
            "4040",
            "--timeout",
            "60",
        ])
        .unwrap();

        let session = cli.session_config();
        assert_eq!(session.url, "http://mcp.example.com:9000/sse");
        assert_eq!(session.transport, TransportKind::Sse);

        let auth = cli.auth_config();
        assert_eq!(auth.callback_port, 4040);
        assert_eq!(auth.timeout, Duration::from_secs(60));
        assert_eq!(auth.redirect_uri(), "http://localhost:4040/callback");
        assert!(auth.client.is_none());
    }

    #[test]
    fn test_preregistered_client() {
        let cli = Cli::try_parse_from([
            "mcplink",
            "--client-id",
            "abc",
            "--client-secret",
            "s3cret",
        ])
        .unwrap();

        let client = cli.auth_config().client.unwrap();
        assert_eq!(client.client_id, "abc");
        assert_eq!(client.client_secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_rejects_unknown_transport() {
        let result = Cli::try_parse_from(["mcplink", "--transport", "stdio"]);
        assert!(result.is_err());
    }
}
