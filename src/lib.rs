//! # pm2io-transport
//!
//! Duplex transport layer of the PM2 IO monitoring agent.
//!
//! ## Overview
//!
//! The agent pushes telemetry (status reports, metrics, events) to a
//! monitoring backend and receives commands back (trigger a custom action,
//! start log forwarding). Two interchangeable transports carry the traffic:
//!
//! - **local**: newline-delimited JSON over a byte stream inherited from a
//!   supervising parent process
//! - **remote**: a websocket to an endpoint chosen by the directory service,
//!   kept alive by heartbeats and re-established on any failure
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pm2io_transport::{ActionRegistry, Agent, AgentConfig};
//!
//! # async fn example() -> pm2io_transport::Result<()> {
//! let registry = Arc::new(ActionRegistry::new());
//! registry.add("Clear cache", |_params| serde_json::json!({"cleared": true}))?;
//!
//! let agent = Agent::start(AgentConfig::from_env(), registry)?;
//! agent.send("human:event", serde_json::json!({"name": "deploy"}));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Transport** trait: the contract both transports satisfy
//! - **Dispatcher**: turns inbound frames into registry calls and replies
//! - **ActionRegistry**: host-registered handlers, keyed by name
//! - **WireFormat**: envelope encoding for the channel and the socket
//! - **Agent**: picks a transport and restarts it on demand

pub mod agent;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export core types
pub use agent::{Agent, TransportFactory};
pub use backoff::Backoff;
pub use codec::{fan_out_status, LineReader, WireFormat};
pub use config::{AgentConfig, TransportTiming};
pub use dispatch::{Dispatcher, InboundMessage, Outbound};
pub use error::{Result, TransportError};
pub use host::HostFacts;
pub use registry::{Action, ActionHandler, ActionRegistry};
pub use transport::Transport;
pub use types::{
    channels, ActionDescriptor, Envelope, ProcessSnapshot, SessionState, SocketPayload, Status,
};

// Re-export transports for convenience
pub use transport::local::LocalTransport;
pub use transport::remote::{
    EndpointResolver, Handshake, HttpEndpointResolver, RemoteTransport, SocketConnector,
    WsConnector,
};
