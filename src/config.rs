//! Agent configuration consumed by the transports
//!
//! The host owns the configuration; transports only read it.

use crate::backoff::Backoff;
use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Directory host queried when no node is pinned
pub const DEFAULT_NODE: &str = "api.cloud.pm2.io";

/// Protocol version announced in the socket handshake
pub const PROTOCOL_VERSION: &str = "1";

/// Environment variable holding the inherited IPC descriptor
pub const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

/// Credentials and identity of the monitored process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Public bucket key
    pub public_key: String,

    /// Secret bucket key
    pub private_key: String,

    /// Machine name shown on the dashboard
    pub server_name: String,

    /// Host name reported in the verification request
    pub hostname: String,

    /// Application (process) name
    pub name: String,

    /// Optional HTTP(S) proxy URL for both the directory call and the socket
    pub proxy: Option<String>,

    /// Pinned directory host; `DEFAULT_NODE` when unset
    pub node: Option<String>,

    /// Agent version reported to the remote side
    pub version: String,

    /// Overrides the default `PM2 Agent Rust v<version>` user agent
    pub user_agent: Option<String>,

    /// Run under a supervising parent process (local channel transport)
    pub non_standalone: bool,

    /// Timers, deadlines and retry policies
    pub timing: TransportTiming,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            private_key: String::new(),
            server_name: String::new(),
            hostname: String::new(),
            name: String::new(),
            proxy: None,
            node: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: None,
            non_standalone: false,
            timing: TransportTiming::default(),
        }
    }
}

impl AgentConfig {
    /// Build a configuration from the conventional `PM2_*` environment variables
    ///
    /// Missing variables keep their defaults; call `validate()` afterwards.
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            public_key: var("PM2_PUBLIC_KEY").unwrap_or_default(),
            private_key: var("PM2_SECRET_KEY").unwrap_or_default(),
            server_name: var("PM2_MACHINE_NAME").unwrap_or_default(),
            hostname: var("HOSTNAME").unwrap_or_default(),
            name: var("PM2_APP_NAME").unwrap_or_default(),
            proxy: var("PM2_PROXY"),
            node: var("PM2_NODE"),
            non_standalone: std::env::var_os(CHANNEL_FD_ENV).is_some(),
            ..defaults
        }
    }

    /// Directory host to query
    pub fn node(&self) -> &str {
        self.node.as_deref().unwrap_or(DEFAULT_NODE)
    }

    /// Full verification URL on the directory host
    pub fn verify_url(&self) -> String {
        format!("https://{}/api/node/verifyPM2", self.node())
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("PM2 Agent Rust v{}", self.version))
    }

    /// Proxy URL, if one is configured and parses
    ///
    /// An unparsable proxy is logged and ignored so the agent falls back
    /// to a direct connection.
    pub fn proxy_url(&self) -> Option<reqwest::Url> {
        let raw = self.proxy.as_deref().filter(|p| !p.is_empty())?;
        match reqwest::Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(proxy = raw, error = %e, "Proxy config incorrect, using default network");
                None
            }
        }
    }

    /// Check that the configuration can drive the selected transport
    pub fn validate(&self) -> Result<()> {
        if self.timing.max_in_flight_actions == Some(0) {
            return Err(TransportError::Config(
                "At least one action must be allowed in flight".to_string(),
            ));
        }
        if self.non_standalone {
            return Ok(());
        }
        if self.public_key.is_empty() || self.private_key.is_empty() {
            return Err(TransportError::Config(
                "Both public and private keys are required for the remote transport".to_string(),
            ));
        }
        if self.server_name.is_empty() {
            return Err(TransportError::Config(
                "Server name cannot be empty".to_string(),
            ));
        }
        self.timing.validate()
    }
}

/// Timers and retry policies of the remote transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportTiming {
    /// Liveness ping cadence
    pub heartbeat_interval_secs: u64,

    /// Endpoint re-resolution cadence
    pub refresh_interval_secs: u64,

    /// Delay policy after a failed resolution
    pub resolve_backoff: Backoff,

    /// Delay policy after a failed dial
    pub dial_backoff: Backoff,

    /// Upper bound on a single socket write
    pub write_deadline_secs: u64,

    /// Upper bound on the verification HTTP request
    pub resolve_timeout_secs: u64,

    /// Upper bound on a single action handler run; `None` waits forever
    pub action_timeout_secs: Option<u64>,

    /// Handlers allowed to run at once, timed-out ones included
    pub max_in_flight_actions: Option<usize>,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            refresh_interval_secs: 600,
            resolve_backoff: Backoff::fixed(Duration::from_secs(10)),
            dial_backoff: Backoff::fixed(Duration::from_secs(2)),
            write_deadline_secs: 30,
            resolve_timeout_secs: 30,
            action_timeout_secs: Some(30),
            max_in_flight_actions: Some(16),
        }
    }
}

impl TransportTiming {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 || self.refresh_interval_secs == 0 {
            return Err(TransportError::Config(
                "Heartbeat and refresh intervals must be >= 1s".to_string(),
            ));
        }
        if self.write_deadline_secs == 0 {
            return Err(TransportError::Config(
                "Write deadline must be >= 1s".to_string(),
            ));
        }
        Ok(())
    }
}
