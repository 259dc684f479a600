#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use node_agent::auth::Authenticator;
use node_agent::policy::SecurityPolicy;
use node_agent::protocol::OutboundMessage;
use node_agent::pty::PtyManager;
use node_agent::router::{CommandRouter, FrameSink};

pub const SECRET: &str = "test-secret";
pub const TOKEN: &str = "test-token";

pub fn authenticator() -> Authenticator {
    Authenticator::new(SECRET, TOKEN)
}

pub fn signed(envelope: Value) -> Value {
    authenticator().sign(&envelope).expect("sign envelope")
}

/// Records every outbound frame as JSON.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<Value>>,
}

impl CollectingSink {
    pub fn frames(&self) -> Vec<Value> {
        self.frames.lock().unwrap().clone()
    }

    pub fn frames_of(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    /// Concatenated `pty_output` data for one session.
    pub fn pty_output(&self, session_id: &str) -> String {
        self.frames_of("pty_output")
            .iter()
            .filter(|frame| frame["session_id"] == session_id)
            .filter_map(|frame| frame["data"].as_str().map(str::to_string))
            .collect()
    }
}

impl FrameSink for CollectingSink {
    fn send(&self, message: &OutboundMessage) -> bool {
        let frame = serde_json::to_value(message).expect("encode frame");
        self.frames.lock().unwrap().push(frame);
        true
    }
}

pub struct TestAgent {
    pub router: Arc<CommandRouter>,
    pub sink: Arc<CollectingSink>,
    pub pty: PtyManager,
}

impl TestAgent {
    pub fn new() -> Self {
        let sink = Arc::new(CollectingSink::default());
        let pty = PtyManager::new();
        let router = Arc::new(CommandRouter::new(
            authenticator(),
            SecurityPolicy::new().expect("build policy"),
            pty.clone(),
            sink.clone(),
            false,
        ));
        Self { router, sink, pty }
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
