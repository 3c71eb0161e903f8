//! Transport trait shared by the local and remote transports
//!
//! The host talks to a `dyn Transport` and can swap the local channel
//! for the remote socket without changing application code. Every
//! method is a non-blocking trigger: network I/O happens on background
//! tasks and failures are logged, never returned.

use crate::codec::WireFormat;
use crate::config::AgentConfig;
use crate::dispatch::{Dispatcher, Outbound};
use async_trait::async_trait;
use std::sync::Arc;

pub mod local;
pub mod remote;

pub use local::LocalTransport;
pub use remote::RemoteTransport;

/// Duplex channel between the agent and the monitoring endpoint
///
/// Methods other than `shutdown` must be called from within a Tokio
/// runtime, since they spawn background tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g., "local", "remote")
    fn name(&self) -> &str;

    /// Configuration this transport was built from
    fn config(&self) -> &AgentConfig;

    /// Establish a session; idempotent, returns immediately
    fn connect(&self);

    /// Arm the inbound reader loop
    ///
    /// Default is a no-op for transports that arm it on connect.
    fn start(&self) {}

    /// Send `data` on `channel`; dropped silently when not connected
    fn send(&self, channel: &str, data: serde_json::Value);

    /// Send a pre-built JSON document unchanged
    fn send_json(&self, message: serde_json::Value);

    /// Whether a session is currently usable
    fn is_connected(&self) -> bool;

    /// Drop the current session and establish a fresh one
    fn close_and_reconnect(&self);

    /// Socket endpoint currently assigned, if any
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Stop background tasks and close the underlying stream
    async fn shutdown(&self);
}

/// Internal outbound surface used to emit dispatcher replies
pub(crate) trait ReplySink: Send + Sync + 'static {
    fn send(&self, channel: &str, data: serde_json::Value);
    fn send_json(&self, message: serde_json::Value);
}

/// Emit replies in order through the transport's own send paths
pub(crate) fn deliver<S: ReplySink + ?Sized>(sink: &S, replies: Vec<Outbound>) {
    for reply in replies {
        match reply {
            Outbound::Envelope(envelope) => sink.send(&envelope.channel, envelope.payload),
            Outbound::Raw(message) => sink.send_json(message),
        }
    }
}

/// Dispatch one inbound frame on its own task
///
/// Keeps slow action handlers from stalling the reader loop.
pub(crate) fn spawn_dispatch<S: ReplySink>(
    sink: Arc<S>,
    dispatcher: Arc<Dispatcher>,
    format: WireFormat,
    frame: Vec<u8>,
) {
    tokio::spawn(async move {
        let replies = dispatcher.dispatch_frame(format, &frame).await;
        deliver(sink.as_ref(), replies);
    });
}
