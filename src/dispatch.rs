//! Inbound message dispatch
//!
//! Frames are decoded once into an [`InboundMessage`] variant. The
//! [`Dispatcher`] interprets the variant and returns the replies the
//! transport must emit; it never writes to the wire itself, so the same
//! logic serves both transports.

use crate::codec::WireFormat;
use crate::registry::ActionRegistry;
use crate::types::{channels, Envelope};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Built-in sub-method of `trigger:pm2:action` that is acknowledged
pub const START_LOGGING: &str = "startLogging";

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Invoke a registered action
    TriggerAction {
        action_name: String,
        process_id: Value,
        payload: Value,
    },
    /// Built-in process-manager sub-protocol
    TriggerPm2Action { method_name: String },
    /// Well-formed envelope on a channel this agent does not handle
    Unknown { channel: String },
    /// Frame that could not be interpreted
    Invalid { reason: String },
}

impl InboundMessage {
    /// Decode a raw frame; never fails, malformed input becomes `Invalid`
    pub fn decode(format: WireFormat, frame: &[u8]) -> Self {
        match format.decode(frame) {
            Ok(envelope) => Self::from_envelope(envelope),
            Err(e) => Self::Invalid {
                reason: e.to_string(),
            },
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Self {
        match envelope.channel.as_str() {
            channels::TRIGGER_ACTION => {
                let Some(name) = envelope.payload.get("action_name").and_then(Value::as_str)
                else {
                    return Self::Invalid {
                        reason: "trigger:action without a string payload.action_name"
                            .to_string(),
                    };
                };
                Self::TriggerAction {
                    action_name: name.to_string(),
                    process_id: envelope
                        .payload
                        .get("process_id")
                        .cloned()
                        .unwrap_or(Value::Null),
                    payload: envelope.payload,
                }
            }
            channels::TRIGGER_PM2_ACTION => {
                match envelope.payload.get("method_name").and_then(Value::as_str) {
                    Some(method) => Self::TriggerPm2Action {
                        method_name: method.to_string(),
                    },
                    None => Self::Invalid {
                        reason: "trigger:pm2:action without a string payload.method_name"
                            .to_string(),
                    },
                }
            }
            _ => Self::Unknown {
                channel: envelope.channel,
            },
        }
    }
}

/// A reply produced by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Sent through `Transport::send` (wrapped or fanned out per transport)
    Envelope(Envelope),
    /// Sent through `Transport::send_json`, unchanged
    Raw(Value),
}

impl Outbound {
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Envelope(env) => Some(&env.channel),
            Self::Raw(value) => value.get("channel").and_then(Value::as_str),
        }
    }
}

/// Routes inbound messages to the action registry or built-in responses
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    action_timeout: Option<Duration>,
    in_flight: Option<(usize, Arc<Semaphore>)>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            action_timeout: None,
            in_flight: None,
        }
    }

    /// Bound each handler run; `None` waits forever
    ///
    /// A timed-out handler is only abandoned: its blocking-pool thread
    /// keeps running until the handler returns. Pair this with
    /// [`with_max_in_flight`](Self::with_max_in_flight) so a handler that
    /// hangs cannot pin an unbounded number of threads.
    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Cap handlers running at once; `None` leaves them unbounded
    ///
    /// A slot is released when the handler returns, not when its reply
    /// is sent, so abandoned handlers keep counting. Triggers that find
    /// no free slot fail immediately.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.in_flight = limit.map(|n| (n, Arc::new(Semaphore::new(n))));
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Decode and handle one raw frame
    pub async fn dispatch_frame(&self, format: WireFormat, frame: &[u8]) -> Vec<Outbound> {
        self.dispatch(InboundMessage::decode(format, frame)).await
    }

    /// Handle one decoded message, returning replies in emission order
    pub async fn dispatch(&self, message: InboundMessage) -> Vec<Outbound> {
        match message {
            InboundMessage::TriggerAction {
                action_name,
                process_id,
                payload,
            } => match self.run_action(&action_name, payload).await {
                Ok(ret) => {
                    tracing::debug!(action = %action_name, "Action completed");
                    vec![
                        Outbound::Envelope(Envelope::new(
                            channels::TRIGGER_ACTION_SUCCESS,
                            json!({
                                "success": true,
                                "id": process_id,
                                "action_name": action_name,
                            }),
                        )),
                        Outbound::Envelope(Envelope::new(
                            channels::AXM_REPLY,
                            json!({
                                "action_name": action_name,
                                "return": ret,
                            }),
                        )),
                    ]
                }
                Err(reason) => {
                    tracing::warn!(action = %action_name, reason = %reason, "Action failed");
                    vec![Outbound::Envelope(Envelope::new(
                        channels::TRIGGER_ACTION_FAILURE,
                        json!({
                            "success": false,
                            "id": process_id,
                            "action_name": action_name,
                            "err": reason,
                        }),
                    ))]
                }
            },
            InboundMessage::TriggerPm2Action { method_name } => {
                if method_name == START_LOGGING {
                    vec![Outbound::Raw(json!({
                        "channel": channels::TRIGGER_PM2_RESULT,
                        "payload": { "ret": { "err": null } },
                    }))]
                } else {
                    tracing::debug!(method = %method_name, "Ignoring unsupported pm2 method");
                    Vec::new()
                }
            }
            InboundMessage::Unknown { channel } => {
                tracing::warn!(channel = %channel, "Message on unregistered channel");
                Vec::new()
            }
            InboundMessage::Invalid { reason } => {
                tracing::warn!(reason = %reason, "Skipping malformed inbound frame");
                Vec::new()
            }
        }
    }

    /// Run a handler on the blocking pool, bounded by the action timeout
    async fn run_action(&self, name: &str, payload: Value) -> Result<Value, String> {
        let handler = self.registry.handler(name).map_err(|e| e.to_string())?;
        let permit = match &self.in_flight {
            Some((limit, slots)) => Some(
                Arc::clone(slots)
                    .try_acquire_owned()
                    .map_err(|_| format!("Too many actions in flight (limit {})", limit))?,
            ),
            None => None,
        };
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            handler(&payload)
        });

        let joined = match self.action_timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| format!("Action timed out after {}ms", limit.as_millis()))?,
            None => task.await,
        };

        joined.map_err(|e| {
            if e.is_panic() {
                "Action handler panicked".to_string()
            } else {
                format!("Action handler aborted: {}", e)
            }
        })
    }
}
