use std::fmt;
use std::time::Duration;

use url::Url;

use node_agent_error::AgentError;

pub const CHANNEL_PATH: &str = "/api/v2/agent/ws";
pub const REPORT_PATH: &str = "/api/v2/agent/report";
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Validated runtime configuration. Secrets never appear in `Debug` output.
#[derive(Clone)]
pub struct AgentConfig {
    controller_url: Url,
    token: String,
    node_uuid: String,
    hmac_secret: String,
    host_mode: bool,
    report_interval: Option<Duration>,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("controller_url", &self.controller_url.as_str())
            .field("token", &"<redacted>")
            .field("node_uuid", &self.node_uuid)
            .field("hmac_secret", &"<redacted>")
            .field("host_mode", &self.host_mode)
            .field("report_interval", &self.report_interval)
            .finish()
    }
}

impl AgentConfig {
    pub fn new(
        controller_url: &str,
        token: impl Into<String>,
        node_uuid: impl Into<String>,
        hmac_secret: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let controller_url = Url::parse(controller_url.trim())
            .map_err(|err| AgentError::config(format!("invalid controller url: {err}")))?;
        channel_scheme(&controller_url)?;

        let token = non_empty("token", token.into())?;
        let node_uuid = non_empty("node uuid", node_uuid.into())?;
        let hmac_secret = non_empty("hmac secret", hmac_secret.into())?;

        Ok(Self {
            controller_url,
            token,
            node_uuid,
            hmac_secret,
            host_mode: false,
            report_interval: Some(DEFAULT_REPORT_INTERVAL),
        })
    }

    pub fn with_host_mode(mut self, host_mode: bool) -> Self {
        self.host_mode = host_mode;
        self
    }

    /// `None` disables connection reporting.
    pub fn with_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.report_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    pub fn hmac_secret(&self) -> &str {
        &self.hmac_secret
    }

    pub fn host_mode(&self) -> bool {
        self.host_mode
    }

    pub fn report_interval(&self) -> Option<Duration> {
        self.report_interval
    }

    /// WebSocket endpoint including the credentials query. Never log this.
    pub fn channel_url(&self) -> Result<Url, AgentError> {
        let mut url = self.redacted_channel_url()?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("node_uuid", &self.node_uuid);
        Ok(url)
    }

    /// The channel endpoint without its query, safe for logs.
    pub fn redacted_channel_url(&self) -> Result<Url, AgentError> {
        let mut url = join_path(&self.controller_url, CHANNEL_PATH);
        let scheme = channel_scheme(&self.controller_url)?;
        url.set_scheme(scheme)
            .map_err(|()| AgentError::config(format!("cannot use scheme {scheme}")))?;
        Ok(url)
    }

    pub fn report_url(&self) -> Result<Url, AgentError> {
        let mut url = join_path(&self.controller_url, REPORT_PATH);
        let scheme = match self.controller_url.scheme() {
            "http" | "ws" => "http",
            "https" | "wss" => "https",
            other => return Err(AgentError::config(format!("unsupported url scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|()| AgentError::config(format!("cannot use scheme {scheme}")))?;
        Ok(url)
    }
}

fn channel_scheme(url: &Url) -> Result<&'static str, AgentError> {
    match url.scheme() {
        "http" | "ws" => Ok("ws"),
        "https" | "wss" => Ok("wss"),
        other => Err(AgentError::config(format!("unsupported url scheme {other}"))),
    }
}

fn join_path(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}{suffix}", base.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn non_empty(name: &str, value: String) -> Result<String, AgentError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AgentError::config(format!("{name} must not be empty")));
    }
    Ok(trimmed.to_string())
}
