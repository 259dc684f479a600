//! Process-wide reaper for PTY children.
//!
//! Only pids handed to [`ChildReaper::register`] are ever waited on, so
//! children owned by `tokio::process` keep their exit statuses.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_POLL: Duration = Duration::from_millis(10);

static REAPER: OnceLock<ChildReaper> = OnceLock::new();
static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Default)]
pub struct ChildReaper {
    pids: Mutex<HashSet<i32>>,
}

pub fn global() -> &'static ChildReaper {
    REAPER.get_or_init(ChildReaper::default)
}

/// Starts the SIGCHLD listener and periodic sweep. Later calls are no-ops.
/// Must be called from within a tokio runtime.
pub fn install() {
    if INSTALLED.set(()).is_err() {
        return;
    }
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(error = %err, "failed to listen for SIGCHLD; relying on periodic sweep");
            None
        }
    };
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            match sigchld.as_mut() {
                Some(stream) => {
                    tokio::select! {
                        _ = stream.recv() => {}
                        _ = sweep.tick() => {}
                    }
                }
                None => {
                    sweep.tick().await;
                }
            }
            global().reap_all();
        }
    });
}

impl ChildReaper {
    fn pids(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.pids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, pid: Pid) {
        self.pids().insert(pid.as_raw());
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.pids().contains(&pid.as_raw())
    }

    /// Returns `true` once `pid` has been reaped (by this call or earlier).
    ///
    /// An unregistered pid is reported as reaped without calling `waitpid`,
    /// so a recycled pid is never touched.
    pub fn try_reap(&self, pid: Pid) -> bool {
        let mut pids = self.pids();
        if !pids.contains(&pid.as_raw()) {
            return true;
        }
        let reaped = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::debug!(pid = pid.as_raw(), code, "reaped pty child");
                true
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::debug!(pid = pid.as_raw(), signal = %signal, "reaped pty child");
                true
            }
            Ok(_) => false,
            Err(Errno::ECHILD) => true,
            Err(err) => {
                tracing::warn!(pid = pid.as_raw(), error = %err, "waitpid failed");
                false
            }
        };
        if reaped {
            pids.remove(&pid.as_raw());
        }
        reaped
    }

    pub fn reap_all(&self) {
        let pids: Vec<i32> = self.pids().iter().copied().collect();
        for pid in pids {
            self.try_reap(Pid::from_raw(pid));
        }
    }

    /// Blocks the calling thread until `pid` is reaped or `timeout` elapses.
    pub fn wait_blocking(&self, pid: Pid, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_reap(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn unregistered_pids_are_never_waited_on() {
        let reaper = ChildReaper::default();
        let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        assert!(reaper.try_reap(pid));
        // std still owns the exit status.
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn registered_child_is_reaped_once() {
        let reaper = ChildReaper::default();
        let child = Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        reaper.register(pid);

        assert!(reaper.wait_blocking(pid, Duration::from_secs(5)));
        assert!(!reaper.is_registered(pid));
        assert!(reaper.try_reap(pid));
    }
}
