//! Authenticates command envelopes and dispatches them by type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use node_agent_error::AgentError;

use crate::auth::Authenticator;
use crate::executor::{self, SERVICE_STATUS_SCRIPT, SERVICE_STATUS_TIMEOUT};
use crate::policy::SecurityPolicy;
use crate::protocol::{
    command_id, envelope_kind, parse_payload, CommandKind, CommandResult, ExecScriptRequest,
    OutboundMessage, PtyInputRequest, PtyResizeRequest, ResultStatus, SessionAction,
    ShellSessionRequest,
};
use crate::pty::{OutputCallback, PtyEvent, PtyManager};
use crate::report::MetricsSnapshot;

/// Where results and PTY frames go. `send` is best effort and reports
/// whether the frame was handed to an open connection.
pub trait FrameSink: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> bool;
}

#[derive(Debug, Default)]
struct CommandStats {
    received: AtomicU64,
    rejected: AtomicU64,
}

pub struct CommandRouter {
    authenticator: Authenticator,
    policy: SecurityPolicy,
    pty: PtyManager,
    sink: Arc<dyn FrameSink>,
    host_mode: bool,
    stats: CommandStats,
}

impl CommandRouter {
    pub fn new(
        authenticator: Authenticator,
        policy: SecurityPolicy,
        pty: PtyManager,
        sink: Arc<dyn FrameSink>,
        host_mode: bool,
    ) -> Self {
        Self {
            authenticator,
            policy,
            pty,
            sink,
            host_mode,
            stats: CommandStats::default(),
        }
    }

    pub fn pty(&self) -> &PtyManager {
        &self.pty
    }

    /// Runs one envelope and sends its result, if it produces one.
    pub async fn handle(&self, envelope: Value) {
        let Some(result) = self.dispatch(&envelope).await else {
            return;
        };
        let command_id = result.command_id.clone();
        if !self.sink.send(&OutboundMessage::CommandResult(result)) {
            tracing::warn!(command_id = %command_id, "channel closed; command result dropped");
        }
    }

    /// Authenticates and executes `envelope`, returning the result to report.
    pub async fn dispatch(&self, envelope: &Value) -> Option<CommandResult> {
        let raw_kind = envelope_kind(envelope);
        if matches!(raw_kind, Some("ping") | Some("pong")) {
            return None;
        }

        let command_id = command_id(envelope);
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if let Err(failure) = self.authenticator.verify(envelope) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(command_id = %command_id, reason = %failure, "envelope failed verification");
            tracing::warn!(command_id = %command_id, "rejected unauthenticated command");
            return Some(CommandResult::from_error(command_id, &AgentError::from(failure)));
        }

        let Some(kind) = raw_kind.and_then(CommandKind::parse) else {
            let err = AgentError::UnknownCommand {
                kind: raw_kind.unwrap_or_default().to_string(),
            };
            tracing::warn!(command_id = %command_id, error_type = %err.error_type(), error = %err, "dropping command");
            return None;
        };
        tracing::info!(command_id = %command_id, kind = kind.as_str(), "command received");

        let outcome = match kind {
            CommandKind::ExecScript => self.exec_script(&command_id, envelope).await.map(Some),
            CommandKind::ServiceStatus => self.service_status(&command_id).await.map(Some),
            CommandKind::ShellSession => self.shell_session(&command_id, envelope).await.map(Some),
            CommandKind::PtyInput => self.pty_input(envelope).await.map(|()| None),
            CommandKind::PtyResize => self.pty_resize(envelope).await.map(|()| None),
            CommandKind::Ping => return None,
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                if matches!(err, AgentError::PolicyViolation { .. }) {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!(
                    command_id = %command_id,
                    kind = kind.as_str(),
                    error_type = %err.error_type(),
                    error = %err,
                    "command failed"
                );
                if !err.error_type().produces_result() {
                    return None;
                }
                Some(CommandResult::from_error(command_id, &err))
            }
        }
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_received: self.stats.received.load(Ordering::Relaxed),
            commands_rejected: self.stats.rejected.load(Ordering::Relaxed),
            active_pty_sessions: self.pty.len().await as u64,
        }
    }

    async fn exec_script(&self, command_id: &str, envelope: &Value) -> Result<CommandResult, AgentError> {
        let request: ExecScriptRequest = parse_payload(envelope)?;
        self.policy.check(&request.script_content)?;
        let outcome = executor::run_script(&request.script_content, request.timeout()).await?;
        Ok(CommandResult::from_exit(command_id, outcome.output, outcome.exit_code))
    }

    async fn service_status(&self, command_id: &str) -> Result<CommandResult, AgentError> {
        let outcome = executor::run_script(SERVICE_STATUS_SCRIPT, SERVICE_STATUS_TIMEOUT).await?;
        Ok(CommandResult::from_exit(command_id, outcome.output, outcome.exit_code))
    }

    async fn shell_session(&self, command_id: &str, envelope: &Value) -> Result<CommandResult, AgentError> {
        let request: ShellSessionRequest = parse_payload(envelope)?;
        match request.action {
            SessionAction::Open => {
                check_window(request.cols, request.rows)?;
                self.pty
                    .create(
                        &request.session_id,
                        self.pty_callback(),
                        request.cols,
                        request.rows,
                        self.host_mode,
                    )
                    .await?;
                Ok(CommandResult::new(
                    command_id,
                    ResultStatus::Completed,
                    format!("PTY session {} opened", request.session_id),
                    0,
                ))
            }
            SessionAction::Close => {
                self.pty.close(&request.session_id).await?;
                Ok(CommandResult::new(
                    command_id,
                    ResultStatus::Completed,
                    format!("PTY session {} closed", request.session_id),
                    0,
                ))
            }
        }
    }

    async fn pty_input(&self, envelope: &Value) -> Result<(), AgentError> {
        let request: PtyInputRequest = parse_payload(envelope)?;
        self.pty
            .write(&request.session_id, request.data.into_bytes())
            .await
    }

    async fn pty_resize(&self, envelope: &Value) -> Result<(), AgentError> {
        let request: PtyResizeRequest = parse_payload(envelope)?;
        check_window(request.cols, request.rows)?;
        self.pty
            .resize(&request.session_id, request.cols, request.rows)
            .await
    }

    fn pty_callback(&self) -> OutputCallback {
        let sink = Arc::clone(&self.sink);
        Arc::new(move |event: PtyEvent| {
            let message = match event {
                PtyEvent::Output { session_id, data } => OutboundMessage::PtyOutput { session_id, data },
                PtyEvent::Closed { session_id } => OutboundMessage::PtyClosed { session_id },
            };
            // Output produced while disconnected is lost.
            sink.send(&message);
        })
    }
}

fn check_window(cols: u16, rows: u16) -> Result<(), AgentError> {
    if cols == 0 || rows == 0 {
        return Err(AgentError::InvalidPayload {
            message: format!("invalid window size {cols}x{rows}"),
        });
    }
    Ok(())
}
