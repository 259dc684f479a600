//! Interactive PTY sessions tunnelled over the command channel.

mod reaper;
mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use node_agent_error::AgentError;

pub use reaper::{install as install_reaper, ChildReaper};
pub use session::{PtyChild, ReadOutcome, ShellCommand};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const READ_CHUNK: usize = 4096;
/// At most one fork per this window, across all sessions.
pub const FORK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output { session_id: String, data: String },
    Closed { session_id: String },
}

pub type OutputCallback = Arc<dyn Fn(PtyEvent) + Send + Sync>;

/// Owns every PTY session. Cloning shares the same table.
#[derive(Clone)]
pub struct PtyManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<SessionTable>,
    reaper: &'static ChildReaper,
    next_generation: AtomicU64,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, LiveSession>,
    last_fork: Option<Instant>,
}

struct LiveSession {
    /// Distinguishes a session from a later one reusing its id.
    generation: u64,
    child: Arc<PtyChild>,
    cancel: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionTable::default()),
                reaper: reaper::global(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a shell for `session_id`, replacing any session already using
    /// that id. Returns the child's pid.
    pub async fn create(
        &self,
        session_id: &str,
        on_event: OutputCallback,
        cols: u16,
        rows: u16,
        host_mode: bool,
    ) -> Result<i32, AgentError> {
        let mut table = self.inner.state.lock().await;

        if let Some(previous) = table.sessions.remove(session_id) {
            tracing::info!(session_id, pid = previous.child.pid().as_raw(), "replacing existing pty session");
            self.teardown(previous).await;
        }

        if let Some(last) = table.last_fork {
            let elapsed = last.elapsed();
            if elapsed < FORK_INTERVAL {
                tokio::time::sleep(FORK_INTERVAL - elapsed).await;
            }
        }
        table.last_fork = Some(Instant::now());

        let command = ShellCommand::login_shell(host_mode)?;
        let child = tokio::task::spawn_blocking(move || session::spawn(&command, cols, rows))
            .await
            .map_err(|err| AgentError::pty(format!("spawn task failed: {err}")))??;
        let child = Arc::new(child);
        let pid = child.pid();
        self.inner.reaper.register(pid);

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(output_loop(
            self.clone(),
            session_id.to_string(),
            generation,
            Arc::clone(&child),
            Arc::clone(&cancel),
            on_event,
        ));

        table.sessions.insert(
            session_id.to_string(),
            LiveSession {
                generation,
                child,
                cancel,
                reader,
            },
        );
        tracing::info!(session_id, pid = pid.as_raw(), cols, rows, host_mode, "pty session opened");
        Ok(pid.as_raw())
    }

    pub async fn write(&self, session_id: &str, data: Vec<u8>) -> Result<(), AgentError> {
        let child = self.child(session_id).await?;
        tokio::task::spawn_blocking(move || child.write_all(&data))
            .await
            .map_err(|err| AgentError::pty(format!("write task failed: {err}")))?
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), AgentError> {
        let child = self.child(session_id).await?;
        child.resize(cols, rows)?;
        tracing::debug!(session_id, cols, rows, "pty resized");
        Ok(())
    }

    pub async fn close(&self, session_id: &str) -> Result<(), AgentError> {
        let mut table = self.inner.state.lock().await;
        let session = table
            .sessions
            .remove(session_id)
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        self.teardown(session).await;
        tracing::info!(session_id, "pty session closed");
        Ok(())
    }

    pub async fn close_all(&self) {
        let mut table = self.inner.state.lock().await;
        let sessions: Vec<(String, LiveSession)> = table.sessions.drain().collect();
        for (session_id, session) in sessions {
            self.teardown(session).await;
            tracing::info!(session_id = %session_id, "pty session closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.state.lock().await.sessions.contains_key(session_id)
    }

    pub async fn child_pid(&self, session_id: &str) -> Option<i32> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|session| session.child.pid().as_raw())
    }

    async fn child(&self, session_id: &str) -> Result<Arc<PtyChild>, AgentError> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|session| Arc::clone(&session.child))
            .ok_or_else(|| AgentError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Stops the reader, closes the master and terminates the process group.
    async fn teardown(&self, session: LiveSession) {
        session.cancel.store(true, Ordering::Release);
        if let Err(err) = session.reader.await {
            tracing::warn!(error = %err, "pty reader task failed");
        }
        session.child.close_master();
        let child = session.child;
        let reaper = self.inner.reaper;
        if let Err(err) = tokio::task::spawn_blocking(move || child.terminate(reaper)).await {
            tracing::warn!(error = %err, "pty terminate task failed");
        }
    }

    /// Removes a session whose shell exited, unless it was already replaced.
    async fn finish_exited(&self, session_id: String, generation: u64, on_event: OutputCallback) {
        let mut table = self.inner.state.lock().await;
        let current = table
            .sessions
            .get(&session_id)
            .is_some_and(|session| session.generation == generation);
        if !current {
            return;
        }
        if let Some(session) = table.sessions.remove(&session_id) {
            self.teardown(session).await;
        }
        drop(table);
        tracing::info!(session_id = %session_id, "pty session exited");
        on_event(PtyEvent::Closed { session_id });
    }
}

async fn output_loop(
    manager: PtyManager,
    session_id: String,
    generation: u64,
    child: Arc<PtyChild>,
    cancel: Arc<AtomicBool>,
    on_event: OutputCallback,
) {
    let mut chunker = Utf8Chunker::default();
    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        let reader = Arc::clone(&child);
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            reader
                .poll_read(&mut buf, POLL_INTERVAL)
                .map(|outcome| (outcome, buf))
        })
        .await;

        match read {
            Ok(Ok((ReadOutcome::Data(n), buf))) => {
                let data = chunker.push(&buf[..n]);
                if !data.is_empty() {
                    on_event(PtyEvent::Output {
                        session_id: session_id.clone(),
                        data,
                    });
                }
            }
            Ok(Ok((ReadOutcome::Idle, _))) => {}
            Ok(Ok((ReadOutcome::Eof, _))) => break,
            Ok(Err(err)) => {
                tracing::warn!(session_id = %session_id, error = %err, "pty read failed");
                break;
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "pty read task failed");
                break;
            }
        }
    }

    let rest = chunker.finish();
    if !rest.is_empty() {
        on_event(PtyEvent::Output {
            session_id: session_id.clone(),
            data: rest,
        });
    }
    if cancel.load(Ordering::Acquire) {
        return;
    }
    // Teardown awaits this task, so it has to happen elsewhere.
    tokio::spawn(async move {
        manager.finish_exited(session_id, generation, on_event).await;
    });
}

/// Decodes a byte stream as UTF-8, holding back an incomplete trailing
/// sequence until the next chunk arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_sequence_is_carried_over() {
        let bytes = "añb€".as_bytes();
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&bytes[..2]), "a");
        assert_eq!(chunker.push(&bytes[2..5]), "ñb");
        assert_eq!(chunker.push(&bytes[5..6]), "");
        assert_eq!(chunker.push(&bytes[6..]), "€");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(b"ok\xffok"), "ok\u{fffd}ok");
        assert_eq!(chunker.push(b"\xe2\x82"), "");
        assert_eq!(chunker.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() {
        let manager = PtyManager::new();
        let err = manager.write("missing", b"ls\n".to_vec()).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound { .. }));
        let err = manager.resize("missing", 80, 24).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound { .. }));
        let err = manager.close("missing").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound { .. }));
        assert!(manager.is_empty().await);
    }
}
