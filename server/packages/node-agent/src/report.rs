//! Connection records and counters, batched to the controller over HTTP.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use node_agent_error::AgentError;

use crate::router::CommandRouter;

/// Oldest records are dropped beyond this many pending.
pub const MAX_PENDING_RECORDS: usize = 1_000;
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionOutcome {
    /// The handshake never completed.
    ConnectFailed,
    /// Closed by the controller or the network.
    Closed,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub started_at: i64,
    pub ended_at: i64,
    pub duration_secs: f64,
    pub outcome: ConnectionOutcome,
}

impl ConnectionRecord {
    pub fn new(started: OffsetDateTime, ended: OffsetDateTime, outcome: ConnectionOutcome) -> Self {
        let duration = (ended - started).as_seconds_f64().max(0.0);
        Self {
            started_at: started.unix_timestamp(),
            ended_at: ended.unix_timestamp(),
            duration_secs: (duration * 1000.0).round() / 1000.0,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub commands_received: u64,
    pub commands_rejected: u64,
    pub active_pty_sessions: u64,
}

#[derive(Debug, Serialize)]
struct ReportPayload<'a> {
    node_uuid: &'a str,
    records: &'a [ConnectionRecord],
    metrics: Option<MetricsSnapshot>,
}

/// Pending connection records awaiting upload.
#[derive(Debug, Default)]
pub struct ConnectionLog {
    records: Mutex<VecDeque<ConnectionRecord>>,
}

impl ConnectionLog {
    fn records(&self) -> MutexGuard<'_, VecDeque<ConnectionRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, record: ConnectionRecord) {
        let mut records = self.records();
        records.push_back(record);
        while records.len() > MAX_PENDING_RECORDS {
            records.pop_front();
        }
    }

    pub fn take(&self) -> Vec<ConnectionRecord> {
        self.records().drain(..).collect()
    }

    /// Puts a failed batch back ahead of anything recorded since.
    pub fn requeue(&self, batch: Vec<ConnectionRecord>) {
        let mut records = self.records();
        for record in batch.into_iter().rev() {
            records.push_front(record);
        }
        while records.len() > MAX_PENDING_RECORDS {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ReportUploader {
    client: Client,
    url: Url,
    token: String,
    node_uuid: String,
    retry_delays: Vec<Duration>,
}

impl ReportUploader {
    pub fn new(url: Url, token: impl Into<String>, node_uuid: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .map_err(|err| AgentError::config(format!("failed to build report client: {err}")))?;
        Ok(Self {
            client,
            url,
            token: token.into(),
            node_uuid: node_uuid.into(),
            retry_delays: RETRY_DELAYS.to_vec(),
        })
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Posts one batch, retrying after each configured delay.
    pub async fn upload(
        &self,
        records: &[ConnectionRecord],
        metrics: Option<MetricsSnapshot>,
    ) -> Result<(), AgentError> {
        let payload = ReportPayload {
            node_uuid: &self.node_uuid,
            records,
            metrics,
        };
        let mut delays = self.retry_delays.iter();
        let mut attempt = 1;
        loop {
            match self.post(&payload).await {
                Ok(()) => return Ok(()),
                Err(err) => match delays.next() {
                    Some(delay) => {
                        tracing::debug!(attempt, error = %err, "report upload failed; retrying");
                        tokio::time::sleep(*delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    async fn post(&self, payload: &ReportPayload<'_>) -> Result<(), AgentError> {
        self.client
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(|_| ())
            .map_err(|err| AgentError::transport(format!("report request failed: {}", err.without_url())))
    }
}

/// Flushes the connection log every `interval`, and once more on shutdown.
pub fn spawn_report_task(
    uploader: ReportUploader,
    log: Arc<ConnectionLog>,
    router: Arc<CommandRouter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(&uploader, &log, &router).await;
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    flush(&uploader, &log, &router).await;
                    return;
                }
            }
        }
    })
}

/// Resolves once shutdown is requested or its sender is gone. The
/// receiver's read guard is released before returning.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn flush(uploader: &ReportUploader, log: &ConnectionLog, router: &CommandRouter) {
    let records = log.take();
    let metrics = router.metrics_snapshot().await;
    match uploader.upload(&records, Some(metrics)).await {
        Ok(()) => {
            tracing::debug!(records = records.len(), "report uploaded");
        }
        Err(err) => {
            tracing::warn!(records = records.len(), error = %err, "report upload failed; keeping records");
            log.requeue(records);
        }
    }
}
