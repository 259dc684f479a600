//! Persistent WebSocket connection to the controller.
//!
//! One connection at a time. While connected, a sender drains the outbound
//! queue and emits keepalive pings, and a listener hands every inbound
//! envelope to the handler on its own task. Either side ending, or shutdown,
//! ends the connection; the transport then backs off and reconnects.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use node_agent_error::AgentError;

use crate::protocol::{envelope_kind, OutboundMessage};
use crate::report::{ConnectionLog, ConnectionOutcome, ConnectionRecord};
use crate::router::{CommandRouter, FrameSink};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_SCHEDULE_SECS: [u64; 6] = [1, 2, 4, 8, 15, 30];
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Frames queued for the socket beyond this are dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

type ChannelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Receives authenticated-or-not envelopes from the channel.
pub trait EnvelopeHandler: Send + Sync + 'static {
    fn on_envelope(self: Arc<Self>, envelope: Value) -> BoxFuture<'static, ()>;
}

impl EnvelopeHandler for CommandRouter {
    fn on_envelope(self: Arc<Self>, envelope: Value) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.handle(envelope).await })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Reconnect delays: 1, 2, 4, 8, 15, then 30 seconds for every further attempt.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempt: usize,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let index = self.attempt.min(BACKOFF_SCHEDULE_SECS.len() - 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(BACKOFF_SCHEDULE_SECS[index])
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disconnect {
    Closed,
    Error(String),
    Shutdown,
}

pub struct CommandTransport {
    url: Url,
    display_url: String,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    state: watch::Sender<ConnectionState>,
    log: Option<Arc<ConnectionLog>>,
    keepalive: Duration,
}

impl CommandTransport {
    /// `display_url` is what gets logged; `url` carries the credentials.
    pub fn new(url: Url, display_url: &Url) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url,
            display_url: display_url.to_string(),
            outbound: Mutex::new(None),
            state,
            log: None,
            keepalive: KEEPALIVE_INTERVAL,
        }
    }

    pub fn with_connection_log(mut self, log: Arc<ConnectionLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queues `message` on the open connection. Returns `false` when there
    /// is none or its queue is full.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode outbound frame");
                return false;
            }
        };
        match self.outbound().as_ref() {
            Some(tx) => tx.try_send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Connects and reconnects until `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn EnvelopeHandler>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::default();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let started = OffsetDateTime::now_utc();
            tracing::info!(url = %self.display_url, attempt = backoff.attempt(), "connecting to controller");

            let connect = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(self.url.as_str()));
            let connected = tokio::select! {
                result = connect => result,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match connected {
                Ok(Ok((stream, _response))) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(url = %self.display_url, "connected to controller");

                    let disconnect = self.serve(stream, &handler, &mut shutdown).await;
                    let outcome = match &disconnect {
                        Disconnect::Closed => ConnectionOutcome::Closed,
                        Disconnect::Error(_) => ConnectionOutcome::Error,
                        Disconnect::Shutdown => ConnectionOutcome::Shutdown,
                    };
                    self.record(started, outcome);
                    match disconnect {
                        Disconnect::Shutdown => break,
                        Disconnect::Closed => tracing::warn!("controller closed the connection"),
                        Disconnect::Error(error) => tracing::warn!(error = %error, "connection lost"),
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "failed to connect to controller");
                    self.record(started, ConnectionOutcome::ConnectFailed);
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = CONNECT_TIMEOUT.as_secs(), "connection attempt timed out");
                    self.record(started, ConnectionOutcome::ConnectFailed);
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = backoff.next_delay();
            tracing::info!(delay_secs = delay.as_secs(), attempt = backoff.attempt(), "reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        *self.outbound() = None;
        self.set_state(ConnectionState::Stopped);
        tracing::info!("command transport stopped");
    }

    async fn serve(
        &self,
        stream: ChannelStream,
        handler: &Arc<dyn EnvelopeHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        let (mut sink, mut source) = stream.split();
        let mut rx = self.open_queue();

        let keepalive = self.keepalive;
        let sender = async {
            let ping = match serde_json::to_string(&OutboundMessage::Ping) {
                Ok(ping) => ping,
                Err(err) => return Disconnect::Error(err.to_string()),
            };
            let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
            loop {
                let message = tokio::select! {
                    queued = rx.recv() => match queued {
                        Some(message) => message,
                        None => return Disconnect::Closed,
                    },
                    _ = ticker.tick() => Message::Text(ping.clone()),
                };
                if let Err(err) = sink.send(message).await {
                    return Disconnect::Error(err.to_string());
                }
            }
        };

        let listener = async {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_frame(&text, handler),
                    Ok(Message::Close(_)) => return Disconnect::Closed,
                    Ok(_) => {}
                    Err(err) => return Disconnect::Error(err.to_string()),
                }
            }
            Disconnect::Closed
        };

        let disconnect = tokio::select! {
            disconnect = sender => disconnect,
            disconnect = listener => disconnect,
            _ = wait_for_shutdown(shutdown) => Disconnect::Shutdown,
        };

        *self.outbound() = None;
        if let Err(err) = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.unwrap_or(Ok(())) {
            tracing::debug!(error = %err, "close frame not delivered");
        }
        disconnect
    }

    fn open_queue(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        *self.outbound() = Some(tx);
        rx
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<Message>>> {
        self.outbound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn record(&self, started: OffsetDateTime, outcome: ConnectionOutcome) {
        if let Some(log) = &self.log {
            log.record(ConnectionRecord::new(started, OffsetDateTime::now_utc(), outcome));
        }
    }
}

impl FrameSink for CommandTransport {
    fn send(&self, message: &OutboundMessage) -> bool {
        CommandTransport::send(self, message)
    }
}

fn dispatch_frame(text: &str, handler: &Arc<dyn EnvelopeHandler>) {
    let envelope = match decode_frame(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(error_type = %err.error_type(), error = %err, "dropping frame");
            return;
        }
    };
    if matches!(envelope_kind(&envelope), Some("ping") | Some("pong")) {
        return;
    }
    tokio::spawn(Arc::clone(handler).on_envelope(envelope));
}

fn decode_frame(text: &str) -> Result<Value, AgentError> {
    let envelope: Value = serde_json::from_str(text).map_err(|err| AgentError::InvalidFrame {
        message: err.to_string(),
    })?;
    if !envelope.is_object() {
        return Err(AgentError::InvalidFrame {
            message: "frame is not a JSON object".to_string(),
        });
    }
    Ok(envelope)
}

/// Resolves once shutdown is requested or the shutdown sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
