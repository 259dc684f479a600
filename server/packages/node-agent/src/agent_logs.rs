//! Daily log files for the long-running agent.
//!
//! Stdout and stderr are pointed at `log-MM-DD-YY` in the log directory, and
//! re-pointed after each UTC midnight. Files older than the retention
//! period are pruned on every rotation.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

pub const LOGS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const ROTATION_CHECK: Duration = Duration::from_secs(30);

pub struct AgentLogs {
    dir: PathBuf,
    retention: chrono::Duration,
    current_day: Option<NaiveDate>,
}

impl AgentLogs {
    pub fn new(dir: PathBuf, retention: Duration) -> Self {
        Self {
            dir,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(7)),
            current_day: None,
        }
    }

    /// Redirects output now and keeps rotating on a background thread.
    pub fn start_sync(mut self) -> Result<std::thread::JoinHandle<()>, std::io::Error> {
        std::fs::create_dir_all(&self.dir)?;
        self.rotate_sync(Utc::now())?;
        std::thread::Builder::new()
            .name("agent-logs".to_string())
            .spawn(move || self.run_sync())
    }

    fn run_sync(mut self) {
        loop {
            std::thread::sleep(ROTATION_CHECK);
            let now = Utc::now();
            if self.current_day == Some(now.date_naive()) {
                continue;
            }
            if let Err(err) = self.rotate_sync(now) {
                tracing::error!(error = %err, "failed to rotate log file");
            }
        }
    }

    fn rotate_sync(&mut self, now: DateTime<Utc>) -> Result<(), std::io::Error> {
        let path = self.dir.join(log_file_name(now));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let fd = file.as_raw_fd();
        // SAFETY: both descriptors are valid; dup2 atomically replaces the
        // standard streams and `file` may be dropped afterwards.
        unsafe {
            if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        self.current_day = Some(now.date_naive());

        let pruned = prune_older_than(&self.dir, now - self.retention)?;
        if pruned != 0 {
            tracing::debug!(pruned, "pruned old log files");
        }
        Ok(())
    }
}

pub fn log_file_name(now: DateTime<Utc>) -> String {
    format!("log-{}", now.format("%m-%d-%y"))
}

/// Removes `log-*` files last modified before `cutoff`.
fn prune_older_than(dir: &Path, cutoff: DateTime<Utc>) -> Result<usize, std::io::Error> {
    let mut pruned = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("log-") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}
