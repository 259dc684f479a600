//! One-shot script execution with merged output and a hard timeout.

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use node_agent_error::AgentError;

use crate::protocol::MAX_OUTPUT_CHARS;

pub const SHELL: &str = "/bin/sh";

/// Fixed introspection command for `service_status`. Takes no user input.
pub const SERVICE_STATUS_SCRIPT: &str = "if command -v systemctl >/dev/null 2>&1; then \
systemctl list-units --type=service --state=running --no-pager --no-legend; \
else service --status-all 2>&1; fi";
pub const SERVICE_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// After the shell exits, keep reading until the pipe has been quiet this long.
/// Background jobs that inherited the pipe would otherwise hold the result.
const DRAIN_IDLE: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8192;
/// Raw bytes retained before decoding; enough for any UTF-8 rendering of
/// `MAX_OUTPUT_CHARS` characters.
const TAIL_BYTES: usize = MAX_OUTPUT_CHARS * 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub output: String,
    pub exit_code: i32,
}

/// Runs `script` under `/bin/sh -c` in a fresh process group.
///
/// stdout and stderr share one pipe so the output keeps its interleaving. On
/// timeout the whole process group is killed and the shell is reaped before
/// returning [`AgentError::Timeout`].
pub async fn run_script(script: &str, timeout: Duration) -> Result<ScriptOutcome, AgentError> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|err| AgentError::SpawnFailed {
        message: format!("pipe: {err}"),
    })?;
    let stderr_end = write_end.try_clone().map_err(spawn_failed)?;

    let mut command = Command::new(SHELL);
    command
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(spawn_failed)?;
    // The command still owns our copies of the write end; EOF never arrives
    // while they are open.
    drop(command);

    let pid = child.id();
    tracing::debug!(pid = ?pid, "script started");

    let mut reader = pipe_reader(read_end)?;
    match tokio::time::timeout(timeout, collect(&mut child, &mut reader)).await {
        Ok(Ok((tail, status))) => {
            let exit_code = exit_code(status);
            tracing::debug!(pid = ?pid, exit_code, "script finished");
            Ok(ScriptOutcome {
                output: tail.into_string(),
                exit_code,
            })
        }
        Ok(Err(err)) => {
            kill_group(pid);
            let _ = child.wait().await;
            Err(AgentError::Io(err))
        }
        Err(_) => {
            tracing::warn!(pid = ?pid, timeout_secs = timeout.as_secs_f64(), "script timed out");
            kill_group(pid);
            if let Err(err) = child.wait().await {
                tracing::warn!(pid = ?pid, error = %err, "failed to reap timed out script");
            }
            Err(AgentError::Timeout {
                message: Some(format!("exceeded {}s", timeout.as_secs_f64())),
            })
        }
    }
}

fn pipe_reader(fd: OwnedFd) -> Result<pipe::Receiver, AgentError> {
    pipe::Receiver::from_owned_fd(fd).map_err(spawn_failed)
}

async fn collect(
    child: &mut Child,
    reader: &mut pipe::Receiver,
) -> std::io::Result<(OutputTail, ExitStatus)> {
    let mut tail = OutputTail::new(TAIL_BYTES);
    let mut buf = vec![0u8; READ_CHUNK];

    let status = loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read? {
                0 => break child.wait().await?,
                n => tail.push(&buf[..n]),
            },
            status = child.wait() => break status?,
        }
    };

    loop {
        match tokio::time::timeout(DRAIN_IDLE, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => tail.push(&buf[..n]),
        }
    }

    Ok((tail, status))
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        tracing::debug!(pid, error = %err, "killpg failed");
    }
}

/// Signalled children report `128 + signo`, as a shell would.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => node_agent_error::AGENT_FAILURE_EXIT_CODE,
    }
}

fn spawn_failed(err: std::io::Error) -> AgentError {
    AgentError::SpawnFailed {
        message: err.to_string(),
    }
}

/// Byte buffer that keeps only the most recent `cap` bytes.
struct OutputTail {
    bytes: Vec<u8>,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.cap * 2 {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
        }
    }

    fn into_string(mut self) -> String {
        if self.bytes.len() > self.cap {
            let excess = self.bytes.len() - self.cap;
            self.bytes.drain(..excess);
        }
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}
