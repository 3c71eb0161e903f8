//! Core message and state types
//!
//! Field names follow the remote ingestion protocol (snake_case),
//! so most types serialize without renaming.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known channel names
pub mod channels {
    /// Inbound: invoke a registered action
    pub const TRIGGER_ACTION: &str = "trigger:action";
    /// Inbound: built-in process-manager sub-protocol
    pub const TRIGGER_PM2_ACTION: &str = "trigger:pm2:action";

    /// Outbound: action acknowledgement
    pub const TRIGGER_ACTION_SUCCESS: &str = "trigger:action:success";
    /// Outbound: action could not be run
    pub const TRIGGER_ACTION_FAILURE: &str = "trigger:action:failure";
    /// Outbound: action return value
    pub const AXM_REPLY: &str = "axm:reply";
    /// Outbound: process-manager sub-protocol result
    pub const TRIGGER_PM2_RESULT: &str = "trigger:pm2:result";

    /// Outbound: aggregate status, fanned out on the local channel
    pub const STATUS: &str = "status";
    pub const AXM_MONITOR: &str = "axm:monitor";
    pub const AXM_ACTION: &str = "axm:action";
    pub const AXM_OPTIONS: &str = "axm:options";
}

/// The `{channel, payload}` unit exchanged over either transport
///
/// Decoding also accepts the parent-process IPC keys `type` / `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(alias = "type")]
    pub channel: String,

    #[serde(alias = "data", default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Lifecycle of a remote socket session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Resolving,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Public description of a registered action, as listed in a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action_name: String,

    #[serde(default = "default_action_type")]
    pub action_type: String,

    #[serde(default)]
    pub arity: u32,
}

fn default_action_type() -> String {
    "custom".to_string()
}

impl ActionDescriptor {
    pub fn custom(action_name: impl Into<String>) -> Self {
        Self {
            action_name: action_name.into(),
            action_type: default_action_type(),
            arity: 0,
        }
    }
}

/// Snapshot of one monitored process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(default)]
    pub pid: u32,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub server: String,

    /// Metric name → metric value object; computed by the host
    #[serde(default)]
    pub axm_monitor: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub axm_actions: Vec<ActionDescriptor>,

    #[serde(default)]
    pub axm_options: serde_json::Value,
}

/// Aggregate status sent on the `status` channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub process: Vec<ProcessSnapshot>,

    #[serde(default)]
    pub server: serde_json::Value,
}

/// Process identity attached to every socket payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pm_id: u32,
    pub name: String,
    pub server: String,
}

/// Wrapper placed around `data` by the remote transport's `send`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketPayload {
    /// Unix timestamp in milliseconds
    pub at: i64,
    pub process: ProcessIdentity,
    pub data: serde_json::Value,
    pub active: bool,
    pub server_name: String,
    pub protected: bool,
    pub rev_con: bool,
    pub internal_ip: String,
}

impl SocketPayload {
    pub fn new(
        data: serde_json::Value,
        process_name: &str,
        server_name: &str,
        internal_ip: &str,
    ) -> Self {
        Self {
            at: chrono::Utc::now().timestamp_millis(),
            process: ProcessIdentity {
                pm_id: 0,
                name: process_name.to_string(),
                server: server_name.to_string(),
            },
            data,
            active: true,
            server_name: server_name.to_string(),
            protected: false,
            rev_con: true,
            internal_ip: internal_ip.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_accepts_ipc_keys() {
        let env: Envelope =
            serde_json::from_str(r#"{"type": "axm:reply", "data": {"x": 1}}"#).unwrap();
        assert_eq!(env.channel, "axm:reply");
        assert_eq!(env.payload["x"], 1);
    }

    #[test]
    fn test_envelope_missing_payload_is_null() {
        let env: Envelope = serde_json::from_str(r#"{"channel": "ping"}"#).unwrap();
        assert!(env.payload.is_null());
    }

    #[test]
    fn test_status_deserialize_minimal() {
        let status: Status = serde_json::from_value(serde_json::json!({
            "process": [{
                "name": "api",
                "axm_actions": [{"action_name": "Test"}]
            }]
        }))
        .unwrap();
        assert_eq!(status.process.len(), 1);
        assert_eq!(status.process[0].axm_actions[0].action_type, "custom");
        assert!(status.process[0].axm_monitor.is_empty());
    }

    #[test]
    fn test_socket_payload_shape() {
        let payload = SocketPayload::new(serde_json::json!(42), "api", "web-1", "10.0.0.2");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["process"]["pm_id"], 0);
        assert_eq!(value["process"]["name"], "api");
        assert_eq!(value["server_name"], "web-1");
        assert_eq!(value["rev_con"], true);
        assert_eq!(value["protected"], false);
        assert_eq!(value["data"], 42);
        assert!(value["at"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
    }
}
