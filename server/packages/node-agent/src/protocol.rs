//! Wire types for the command channel.
//!
//! Inbound frames are command envelopes kept as raw `serde_json::Value` so the
//! authenticator can canonicalize exactly what the controller signed. Typed
//! request structs are only deserialized after verification.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use node_agent_error::AgentError;

/// Outputs are truncated to the last this-many characters.
pub const MAX_OUTPUT_CHARS: usize = 50_000;
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
/// Requested timeouts are capped here.
pub const MAX_EXEC_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ExecScript,
    ShellSession,
    PtyInput,
    PtyResize,
    ServiceStatus,
    Ping,
}

impl CommandKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exec_script" => Some(Self::ExecScript),
            "shell_session" => Some(Self::ShellSession),
            "pty_input" => Some(Self::PtyInput),
            "pty_resize" => Some(Self::PtyResize),
            "service_status" => Some(Self::ServiceStatus),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecScript => "exec_script",
            Self::ShellSession => "shell_session",
            Self::PtyInput => "pty_input",
            Self::PtyResize => "pty_resize",
            Self::ServiceStatus => "service_status",
            Self::Ping => "ping",
        }
    }
}

/// The raw `type` field of a frame, if present.
pub fn envelope_kind(envelope: &Value) -> Option<&str> {
    envelope.get("type")?.as_str()
}

/// The `command_id` of an envelope, or an empty string when absent.
pub fn command_id(envelope: &Value) -> String {
    match envelope.get("command_id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    }
}

pub fn parse_payload<T: DeserializeOwned>(envelope: &Value) -> Result<T, AgentError> {
    T::deserialize(envelope).map_err(|err| AgentError::InvalidPayload {
        message: err.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecScriptRequest {
    pub script_content: String,
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl ExecScriptRequest {
    pub fn timeout(&self) -> Duration {
        match self.timeout {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Duration::from_secs_f64(secs.min(MAX_EXEC_TIMEOUT.as_secs_f64()))
            }
            _ => DEFAULT_EXEC_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    #[default]
    Open,
    Close,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub action: SessionAction,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyInputRequest {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PtyResizeRequest {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Error,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: ResultStatus,
    pub output: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn new(
        command_id: impl Into<String>,
        status: ResultStatus,
        output: impl Into<String>,
        exit_code: i32,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            status,
            output: truncate_output(output.into()),
            exit_code,
        }
    }

    /// Result for a process that ran to completion: `completed` iff it exited 0.
    pub fn from_exit(command_id: impl Into<String>, output: impl Into<String>, exit_code: i32) -> Self {
        let status = if exit_code == 0 {
            ResultStatus::Completed
        } else {
            ResultStatus::Error
        };
        Self::new(command_id, status, output, exit_code)
    }

    pub fn from_error(command_id: impl Into<String>, err: &AgentError) -> Self {
        let status = match err {
            AgentError::PolicyViolation { .. } => ResultStatus::Blocked,
            _ => ResultStatus::Error,
        };
        Self::new(command_id, status, err.result_output(), err.exit_code())
    }
}

/// Every frame the agent writes to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    CommandResult(CommandResult),
    PtyOutput { session_id: String, data: String },
    PtyClosed { session_id: String },
    Ping,
}

/// Keep only the last [`MAX_OUTPUT_CHARS`] characters.
pub fn truncate_output(output: String) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output;
    }
    match output.char_indices().nth(total - MAX_OUTPUT_CHARS) {
        Some((start, _)) => output[start..].to_string(),
        None => output,
    }
}
