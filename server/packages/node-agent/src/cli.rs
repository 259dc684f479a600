use std::io::{Read, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// Include the generated version constant
mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}
use node_agent_error::AgentError;
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agent::{run_agent, shutdown_on_signal};
use crate::agent_logs::{AgentLogs, LOGS_RETENTION};
use crate::auth::{AuthFailure, Authenticator};
use crate::config::{AgentConfig, DEFAULT_REPORT_INTERVAL};
use crate::policy::SecurityPolicy;

#[derive(Parser, Debug)]
#[command(name = "node-agent", bin_name = "node-agent")]
#[command(about = "Edge node agent for the controller command channel", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct NodeAgentCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the controller and serve commands until terminated.
    Run(RunArgs),
    /// Sign a command envelope read from stdin.
    Sign(SignArgs),
    /// Check a script file against the security policy.
    CheckScript(CheckScriptArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, env = "NODE_AGENT_CONTROLLER_URL")]
    controller_url: String,

    #[arg(long, env = "NODE_AGENT_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long, env = "NODE_AGENT_NODE_UUID")]
    node_uuid: String,

    #[arg(long, env = "NODE_AGENT_HMAC_SECRET", hide_env_values = true)]
    hmac_secret: String,

    /// Run PTY shells inside PID 1's namespaces. Requires root.
    #[arg(long, env = "NODE_AGENT_HOST_MODE")]
    host_mode: bool,

    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL.as_secs())]
    report_interval_secs: u64,

    #[arg(long)]
    no_report: bool,

    /// Write logs to daily files in this directory instead of stderr.
    #[arg(long, env = "NODE_AGENT_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SignArgs {
    #[arg(long, env = "NODE_AGENT_HMAC_SECRET", hide_env_values = true)]
    hmac_secret: String,

    #[arg(long, env = "NODE_AGENT_TOKEN", hide_env_values = true)]
    token: String,

    /// Unix timestamp to sign with. Defaults to now.
    #[arg(long)]
    timestamp: Option<i64>,
}

#[derive(Args, Debug)]
pub struct CheckScriptArgs {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("signing failed: {0}")]
    Sign(#[from] AuthFailure),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("script blocked by rule: {0}")]
    Blocked(&'static str),
}

pub fn run_node_agent() -> Result<(), CliError> {
    let NodeAgentCli { command } = NodeAgentCli::parse();
    if let Err(err) = init_logging(&command) {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(command)
}

pub fn init_logging(command: &Command) -> Result<(), CliError> {
    if let Command::Run(RunArgs {
        log_dir: Some(log_dir),
        ..
    }) = command
    {
        AgentLogs::new(log_dir.clone(), LOGS_RETENTION).start_sync()?;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Run(args) => run(args),
        Command::Sign(args) => sign(&args),
        Command::CheckScript(args) => check_script(&args),
    }
}

fn run(args: RunArgs) -> Result<(), CliError> {
    let report_interval = if args.no_report {
        None
    } else {
        Some(std::time::Duration::from_secs(args.report_interval_secs))
    };
    let config = AgentConfig::new(&args.controller_url, args.token, args.node_uuid, args.hmac_secret)?
        .with_host_mode(args.host_mode)
        .with_report_interval(report_interval);
    tracing::debug!(config = ?config, "loaded configuration");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let shutdown = shutdown_on_signal();
        run_agent(config, shutdown).await
    })?;
    Ok(())
}

fn sign(args: &SignArgs) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let envelope: Value = serde_json::from_str(&input)?;

    let authenticator = Authenticator::new(&args.hmac_secret, &args.token);
    let signed = match args.timestamp {
        Some(ts) => authenticator.sign_at(&envelope, ts)?,
        None => authenticator.sign(&envelope)?,
    };
    write_stdout_line(&serde_json::to_string(&signed)?)
}

fn check_script(args: &CheckScriptArgs) -> Result<(), CliError> {
    let script = std::fs::read_to_string(&args.path)?;
    let policy = SecurityPolicy::new()?;
    match policy.violation(&script) {
        Some(rule) => {
            write_stdout_line(&format!("blocked: {rule}"))?;
            Err(CliError::Blocked(rule))
        }
        None => write_stdout_line("ok"),
    }
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
