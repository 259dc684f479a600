//! Wires the transport, router, PTY engine and reporter into one runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use node_agent_error::AgentError;

use crate::auth::Authenticator;
use crate::config::AgentConfig;
use crate::policy::SecurityPolicy;
use crate::pty::{self, PtyManager};
use crate::report::{spawn_report_task, ConnectionLog, ReportUploader};
use crate::router::CommandRouter;
use crate::transport::CommandTransport;

/// Upper bound on the final report flush during shutdown.
const REPORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs the agent until `shutdown` flips to `true`, then closes every PTY
/// session and flushes pending connection records.
pub async fn run_agent(config: AgentConfig, shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
    if config.host_mode() && !nix::unistd::geteuid().is_root() {
        tracing::warn!("host mode enabled but not running as root; nsenter will likely fail");
    }

    pty::install_reaper();

    let authenticator = Authenticator::new(config.hmac_secret(), config.token());
    let policy = SecurityPolicy::new()?;
    let connection_log = Arc::new(ConnectionLog::default());

    let transport = Arc::new(
        CommandTransport::new(config.channel_url()?, &config.redacted_channel_url()?)
            .with_connection_log(Arc::clone(&connection_log)),
    );
    let pty = PtyManager::new();
    let router = Arc::new(CommandRouter::new(
        authenticator,
        policy,
        pty.clone(),
        transport.clone(),
        config.host_mode(),
    ));

    let reporter = match config.report_interval() {
        Some(interval) => {
            let uploader = ReportUploader::new(config.report_url()?, config.token(), config.node_uuid())?;
            tracing::info!(interval_secs = interval.as_secs(), "connection reporting enabled");
            Some(spawn_report_task(
                uploader,
                Arc::clone(&connection_log),
                Arc::clone(&router),
                interval,
                shutdown.clone(),
            ))
        }
        None => {
            tracing::info!("connection reporting disabled");
            None
        }
    };

    tracing::info!(
        node_uuid = config.node_uuid(),
        host_mode = config.host_mode(),
        "node agent started"
    );
    Arc::clone(&transport).run(router, shutdown).await;

    pty.close_all().await;

    if let Some(reporter) = reporter {
        match tokio::time::timeout(REPORT_DRAIN_TIMEOUT, reporter).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "report task failed"),
            Err(_) => tracing::warn!("final report flush timed out"),
        }
    }

    tracing::info!("node agent stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_termination() -> Result<(), AgentError> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Flips the returned receiver to `true` on the first termination signal.
pub fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(()) => tracing::info!("termination signal received; shutting down"),
            Err(err) => tracing::error!(error = %err, "failed to listen for signals; shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}
