//! Line-oriented command loop over an open session.

use crate::error::SessionError;
use crate::protocol::{McpTool, ToolContent};
use crate::session::{SessionManager, ToolOutcome};
use serde_json::{Map, Value};
use std::io;
use std::ops::ControlFlow;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Prompt shown before each command.
pub const PROMPT: &str = "mcp> ";

const USAGE: &str = "Available commands: list, call <tool_name> [json-arguments], quit";

/// A user command that could not be parsed. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Missing tool name. Usage: call <tool_name> [json-arguments]")]
    MissingToolName,

    #[error("Invalid arguments: {0}. Arguments must be a JSON object")]
    InvalidArguments(String),
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Call {
        name: String,
        arguments: Map<String, Value>,
    },
    Quit,
    Unknown {
        raw: String,
    },
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

impl Command {
    /// Parse a line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, InputError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (keyword, rest) = split_word(line);
        let command = match keyword {
            "quit" if rest.is_empty() => Self::Quit,
            "list" if rest.is_empty() => Self::List,
            "call" => {
                let (name, raw_args) = split_word(rest);
                if name.is_empty() {
                    return Err(InputError::MissingToolName);
                }
                Self::Call {
                    name: name.to_string(),
                    arguments: parse_arguments(raw_args)?,
                }
            }
            _ => Self::Unknown {
                raw: line.to_string(),
            },
        };
        Ok(Some(command))
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, InputError> {
    if raw.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(InputError::InvalidArguments(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(InputError::InvalidArguments(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Why the loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// The user typed `quit`.
    Quit,
    /// Input closed (Ctrl-D or end of piped input).
    EndOfInput,
    /// The session failed; it cannot be used any more.
    ConnectionLost(SessionError),
}

/// Reads commands from `input`, runs them against the session, and writes
/// results to `output`.
pub struct InteractiveLoop<'a, R, W> {
    session: &'a SessionManager,
    input: R,
    output: W,
}

impl<'a, R, W> InteractiveLoop<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(session: &'a SessionManager, input: R, output: W) -> Self {
        Self {
            session,
            input,
            output,
        }
    }

    /// Run until `quit`, end of input, or a session failure.
    ///
    /// Only I/O errors on `input`/`output` are returned as `Err`.
    pub async fn run(&mut self) -> io::Result<LoopExit> {
        self.write_line(USAGE).await?;
        let mut line = String::new();

        loop {
            self.output.write_all(PROMPT.as_bytes()).await?;
            self.output.flush().await?;

            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                self.write_line("").await?;
                return Ok(LoopExit::EndOfInput);
            }

            let command = match Command::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    self.write_line(&format!("Error: {e}")).await?;
                    continue;
                }
            };

            if let ControlFlow::Break(exit) = self.execute(command).await? {
                return Ok(exit);
            }
        }
    }

    async fn execute(&mut self, command: Command) -> io::Result<ControlFlow<LoopExit>> {
        debug!(command = ?command, "Executing command");

        match command {
            Command::Quit => return Ok(ControlFlow::Break(LoopExit::Quit)),
            Command::Unknown { .. } => self.write_line(USAGE).await?,
            Command::List => match self.session.list_operations().await {
                Ok(tools) => self.print_tools(&tools).await?,
                Err(e) => return self.session_error(e).await,
            },
            Command::Call { name, arguments } => {
                match self.session.invoke(&name, arguments).await {
                    Ok(ToolOutcome::Ok { content }) => self.print_content(&content).await?,
                    Ok(ToolOutcome::Failed { message }) => {
                        self.write_line(&format!("Tool error: {message}")).await?
                    }
                    Err(e) => return self.session_error(e).await,
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    async fn session_error(&mut self, error: SessionError) -> io::Result<ControlFlow<LoopExit>> {
        if !error.is_connection_error() {
            warn!(error = %error, "Request failed");
            self.write_line(&format!("Error: {error}")).await?;
            return Ok(ControlFlow::Continue(()));
        }
        self.write_line(&format!("Connection lost: {error}")).await?;
        Ok(ControlFlow::Break(LoopExit::ConnectionLost(error)))
    }

    async fn print_tools(&mut self, tools: &[McpTool]) -> io::Result<()> {
        if tools.is_empty() {
            return self.write_line("No tools available").await;
        }

        self.write_line("Available tools:").await?;
        for (i, tool) in tools.iter().enumerate() {
            self.write_line(&format!("{}. {}", i + 1, tool.name)).await?;
            if let Some(description) = &tool.description {
                self.write_line(&format!("   Description: {description}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn print_content(&mut self, content: &[ToolContent]) -> io::Result<()> {
        self.write_line("Tool result:").await?;
        if content.is_empty() {
            return self.write_line("(no content)").await;
        }
        for part in content {
            self.write_line(&render_content(part)).await?;
        }
        Ok(())
    }

    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.write_all(b"\n").await
    }
}

/// Text verbatim; binary parts summarised.
fn render_content(part: &ToolContent) -> String {
    match part {
        ToolContent::Text { text } => text.clone(),
        ToolContent::Image { data, mime_type } => {
            format!("[image {mime_type}, {} base64 chars]", data.len())
        }
        ToolContent::Audio { data, mime_type } => {
            format!("[audio {mime_type}, {} base64 chars]", data.len())
        }
        ToolContent::Resource { resource } => match &resource.text {
            Some(text) => format!("[resource {}]\n{text}", resource.uri),
            None => format!("[resource {}]", resource.uri),
        },
        ToolContent::Unsupported => "[unsupported content]".to_string(),
    }
}
