use thiserror::Error;

/// Exit code reported for failures that happen inside the agent rather than
/// in the child process.
pub const AGENT_FAILURE_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    InvalidFrame,
    UnknownCommand,
    InvalidPayload,
    AuthenticationFailed,
    PolicyViolation,
    SpawnFailed,
    Timeout,
    SessionNotFound,
    PtyFailure,
    TransportFailure,
    InvalidConfig,
    Io,
}

/// Coarse classes used to decide how a failure surfaces to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Authentication,
    Policy,
    Execution,
    Transport,
    Config,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFrame => "invalid_frame",
            Self::UnknownCommand => "unknown_command",
            Self::InvalidPayload => "invalid_payload",
            Self::AuthenticationFailed => "authentication_failed",
            Self::PolicyViolation => "policy_violation",
            Self::SpawnFailed => "spawn_failed",
            Self::Timeout => "timeout",
            Self::SessionNotFound => "session_not_found",
            Self::PtyFailure => "pty_failure",
            Self::TransportFailure => "transport_failure",
            Self::InvalidConfig => "invalid_config",
            Self::Io => "io",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidFrame | Self::UnknownCommand => ErrorClass::Protocol,
            Self::AuthenticationFailed => ErrorClass::Authentication,
            Self::PolicyViolation => ErrorClass::Policy,
            Self::InvalidPayload
            | Self::SpawnFailed
            | Self::Timeout
            | Self::SessionNotFound
            | Self::PtyFailure
            | Self::Io => ErrorClass::Execution,
            Self::TransportFailure => ErrorClass::Transport,
            Self::InvalidConfig => ErrorClass::Config,
        }
    }

    /// Protocol and transport failures are never answered with a command
    /// result: the first has no trustworthy sender, the second has no channel.
    pub fn produces_result(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::Protocol | ErrorClass::Transport | ErrorClass::Config
        )
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid frame: {message}")]
    InvalidFrame { message: String },
    #[error("unknown command type: {kind}")]
    UnknownCommand { kind: String },
    #[error("invalid command payload: {message}")]
    InvalidPayload { message: String },
    #[error("authentication failed")]
    AuthenticationFailed { reason: Option<String> },
    #[error("blocked by security policy: {rule}")]
    PolicyViolation { rule: String },
    #[error("failed to start process: {message}")]
    SpawnFailed { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("pty failure: {message}")]
    PtyFailure { message: String },
    #[error("transport failure: {message}")]
    TransportFailure { message: String },
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidFrame { .. } => ErrorType::InvalidFrame,
            Self::UnknownCommand { .. } => ErrorType::UnknownCommand,
            Self::InvalidPayload { .. } => ErrorType::InvalidPayload,
            Self::AuthenticationFailed { .. } => ErrorType::AuthenticationFailed,
            Self::PolicyViolation { .. } => ErrorType::PolicyViolation,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::PtyFailure { .. } => ErrorType::PtyFailure,
            Self::TransportFailure { .. } => ErrorType::TransportFailure,
            Self::InvalidConfig { .. } => ErrorType::InvalidConfig,
            Self::Io(_) => ErrorType::Io,
        }
    }

    pub fn pty(message: impl Into<String>) -> Self {
        Self::PtyFailure {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Text placed in the `output` field of a command result.
    ///
    /// Authentication failures always render the same text so the sender
    /// cannot tell which verification step rejected the envelope.
    pub fn result_output(&self) -> String {
        match self {
            Self::AuthenticationFailed { .. } => "Authentication failed".to_string(),
            Self::Timeout { .. } => "Command timed out".to_string(),
            Self::PolicyViolation { rule } => {
                format!("Command blocked by security policy ({rule})")
            }
            Self::InvalidPayload { .. } => "Invalid command payload".to_string(),
            Self::SpawnFailed { message } => format!("Failed to start process: {message}"),
            Self::SessionNotFound { session_id } => format!("PTY session not found: {session_id}"),
            other => other.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        AGENT_FAILURE_EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_output_does_not_leak_reason() {
        let stale = AgentError::AuthenticationFailed {
            reason: Some("timestamp outside window".to_string()),
        };
        let forged = AgentError::AuthenticationFailed {
            reason: Some("signature mismatch".to_string()),
        };
        assert_eq!(stale.result_output(), forged.result_output());
        assert_eq!(stale.to_string(), "authentication failed");
    }

    #[test]
    fn protocol_errors_do_not_produce_results() {
        let err = AgentError::UnknownCommand {
            kind: "reboot_everything".to_string(),
        };
        assert_eq!(err.error_type().class(), ErrorClass::Protocol);
        assert!(!err.error_type().produces_result());
        assert!(ErrorType::PolicyViolation.produces_result());
        assert!(ErrorType::Timeout.produces_result());
    }

    #[test]
    fn timeout_renders_fixed_output() {
        let err = AgentError::Timeout { message: None };
        assert_eq!(err.result_output(), "Command timed out");
        assert_eq!(err.exit_code(), AGENT_FAILURE_EXIT_CODE);
    }
}
