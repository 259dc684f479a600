//! Forking a login shell onto a fresh pseudo-terminal.

use std::ffi::{CString, OsString};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use libc::c_char;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{self, ForkResult, Pid};

use node_agent_error::AgentError;

use super::reaper::ChildReaper;

/// Variables that can make a shell run code before the prompt, or that
/// change how binaries are loaded.
const STRIPPED_ENV: &[&str] = &[
    "BASH_ENV",
    "ENV",
    "PROMPT_COMMAND",
    "SHELLOPTS",
    "BASHOPTS",
    "CDPATH",
    "IFS",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
];
const AGENT_ENV_PREFIX: &str = "NODE_AGENT_";
const TERM: &str = "xterm-256color";
/// Highest signal number on Linux.
const MAX_SIGNAL: libc::c_int = 64;
const WRITE_RETRY_LIMIT: Duration = Duration::from_secs(5);

const TERM_GRACE: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Program, argv and envp for the shell, encoded before `fork` so the child
/// never allocates.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ShellCommand {
    /// Interactive login shell; wrapped in `nsenter` to join PID 1's
    /// namespaces when `host_mode` is set.
    pub fn login_shell(host_mode: bool) -> Result<Self, AgentError> {
        let shell = ["/bin/bash", "/bin/sh"]
            .into_iter()
            .find(|candidate| Path::new(candidate).exists())
            .unwrap_or("/bin/sh");
        let mut args: Vec<String> = vec![shell.to_string(), "-l".to_string(), "-i".to_string()];

        let program = if host_mode {
            let nsenter = find_in_path("nsenter").unwrap_or_else(|| PathBuf::from("/usr/bin/nsenter"));
            let mut wrapped: Vec<String> = ["nsenter", "-t", "1", "-m", "-u", "-i", "-n", "-p", "--"]
                .into_iter()
                .map(str::to_string)
                .collect();
            wrapped.append(&mut args);
            args = wrapped;
            nsenter.to_string_lossy().into_owned()
        } else {
            shell.to_string()
        };

        Self::new(&program, &args, sanitized_env(std::env::vars_os()))
    }

    fn new(program: &str, args: &[String], envp: Vec<CString>) -> Result<Self, AgentError> {
        let program = c_string(program.as_bytes())?;
        let argv = args
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            program,
            argv,
            envp,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }

    pub fn args(&self) -> &[CString] {
        &self.argv
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, AgentError> {
    CString::new(bytes).map_err(|err| AgentError::SpawnFailed {
        message: format!("invalid argument: {err}"),
    })
}

/// Copies the agent's environment minus shell start-up hooks, loader
/// overrides and every `NODE_AGENT_*` variable, with `TERM` forced.
pub(crate) fn sanitized_env<I>(vars: I) -> Vec<CString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut envp: Vec<CString> = vars
        .into_iter()
        .filter(|(key, _)| {
            let Some(key) = key.to_str() else {
                return false;
            };
            key != "TERM" && !key.starts_with(AGENT_ENV_PREFIX) && !STRIPPED_ENV.contains(&key)
        })
        .filter_map(|(key, value)| {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).ok()
        })
        .collect();
    envp.extend(CString::new(format!("TERM={TERM}")).ok());
    envp
}

fn find_in_path(binary_name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let candidate = path.join(binary_name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Idle,
    Eof,
}

/// Master side of a running PTY plus the shell's pid (also its pgid).
#[derive(Debug)]
pub struct PtyChild {
    master: RwLock<Option<OwnedFd>>,
    pid: Pid,
}

/// Opens a PTY of the given size and forks `command` onto it. Blocking.
pub fn spawn(command: &ShellCommand, cols: u16, rows: u16) -> Result<PtyChild, AgentError> {
    let winsize = window(cols, rows);
    let pty = openpty(Some(&winsize), None)
        .map_err(|err| AgentError::pty(format!("openpty failed: {err}")))?;
    set_cloexec(&pty.master)?;
    set_cloexec(&pty.slave)?;

    let argv = null_terminated(&command.argv);
    let envp = null_terminated(&command.envp);
    let slave = pty.slave.as_raw_fd();

    // Safety: the child branch only calls async-signal-safe libc functions on
    // memory prepared above, then execs or `_exit`s.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Child) => unsafe {
            exec_child(slave, &winsize, command.program.as_ptr(), argv.as_ptr(), envp.as_ptr())
        },
        Ok(ForkResult::Parent { child }) => {
            drop(pty.slave);
            if let Err(err) = set_nonblocking(&pty.master) {
                let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(child, None);
                return Err(err);
            }
            Ok(PtyChild {
                master: RwLock::new(Some(pty.master)),
                pid: child,
            })
        }
        Err(err) => Err(AgentError::SpawnFailed {
            message: format!("fork failed: {err}"),
        }),
    }
}

fn null_terminated(items: &[CString]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|item| item.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

unsafe fn exec_child(
    slave: RawFd,
    winsize: &Winsize,
    program: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> ! {
    for signo in 1..=MAX_SIGNAL {
        if signo != libc::SIGKILL && signo != libc::SIGSTOP {
            libc::signal(signo, libc::SIG_DFL);
        }
    }
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    if libc::setsid() < 0 {
        child_fail(b"node-agent: setsid failed\n");
    }
    if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
        child_fail(b"node-agent: TIOCSCTTY failed\n");
    }
    libc::ioctl(slave, libc::TIOCSWINSZ as _, winsize as *const Winsize);

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if libc::dup2(slave, target) < 0 {
            child_fail(b"node-agent: dup2 failed\n");
        }
    }
    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    }

    libc::execve(program, argv, envp);
    child_fail(b"node-agent: exec failed\n");
}

unsafe fn child_fail(message: &[u8]) -> ! {
    libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    libc::_exit(127)
}

fn window(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), AgentError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(|err| AgentError::pty(format!("fcntl F_SETFD: {err}")))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), AgentError> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|err| AgentError::pty(format!("fcntl F_GETFL: {err}")))?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .map(|_| ())
        .map_err(|err| AgentError::pty(format!("fcntl F_SETFL: {err}")))
}

impl PtyChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn master(&self) -> RwLockReadGuard<'_, Option<OwnedFd>> {
        self.master.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits up to `timeout` for output and reads at most `buf.len()` bytes.
    pub fn poll_read(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadOutcome, AgentError> {
        let guard = self.master();
        let Some(master) = guard.as_ref() else {
            return Ok(ReadOutcome::Eof);
        };

        let timeout = u16::try_from(timeout.as_millis())
            .map(PollTimeout::from)
            .unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(ReadOutcome::Idle),
            Ok(_) => {}
            Err(err) => return Err(AgentError::pty(format!("poll: {err}"))),
        }

        match unistd::read(master.as_raw_fd(), buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(ReadOutcome::Idle),
            // The slave side closed: the shell exited.
            Err(Errno::EIO) => Ok(ReadOutcome::Eof),
            Err(err) => Err(AgentError::pty(format!("pty read: {err}"))),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> Result<(), AgentError> {
        let guard = self.master();
        let Some(master) = guard.as_ref() else {
            return Err(AgentError::pty("pty is closed"));
        };

        let started = Instant::now();
        let mut written = 0;
        while written < data.len() {
            match unistd::write(master, &data[written..]) {
                Ok(n) => written += n,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                    if started.elapsed() > WRITE_RETRY_LIMIT {
                        return Err(AgentError::pty("pty write: buffer full"));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(err) => return Err(AgentError::pty(format!("pty write: {err}"))),
            }
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), AgentError> {
        let guard = self.master();
        let Some(master) = guard.as_ref() else {
            return Err(AgentError::pty("pty is closed"));
        };
        let winsize = window(cols, rows);
        // Safety: TIOCSWINSZ reads one `winsize` from a valid pointer.
        let rc = unsafe {
            libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize as *const Winsize)
        };
        if rc < 0 {
            return Err(AgentError::pty(format!(
                "resize failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn close_master(&self) {
        let mut guard = self.master.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.take();
    }

    /// SIGTERM the process group, escalate to SIGKILL after [`TERM_GRACE`],
    /// and reap. Blocking.
    pub fn terminate(&self, reaper: &ChildReaper) {
        let pid = self.pid;
        if reaper.try_reap(pid) {
            return;
        }
        if let Err(err) = killpg(pid, Signal::SIGTERM) {
            tracing::debug!(pid = pid.as_raw(), error = %err, "SIGTERM failed");
        }
        if reaper.wait_blocking(pid, TERM_GRACE) {
            return;
        }
        tracing::debug!(pid = pid.as_raw(), "pty child ignored SIGTERM; sending SIGKILL");
        if let Err(err) = killpg(pid, Signal::SIGKILL) {
            tracing::debug!(pid = pid.as_raw(), error = %err, "SIGKILL failed");
        }
        if !reaper.wait_blocking(pid, KILL_WAIT) {
            tracing::warn!(pid = pid.as_raw(), "pty child not reaped after SIGKILL");
        }
    }
}
