//! Agent facade
//!
//! Chooses a transport from the configuration, wires it to the host's
//! action registry and keeps it running. The host talks to the `Agent`
//! and never needs to know which transport is underneath.

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TransportError};
use crate::registry::ActionRegistry;
use crate::transport::{LocalTransport, RemoteTransport, Transport};
use crate::types::{channels, Status};

/// Builds a transport for a configuration and dispatcher
pub type TransportFactory =
    Box<dyn Fn(&AgentConfig, Arc<Dispatcher>) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Running agent: one active transport bound to one action registry
pub struct Agent {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    factory: TransportFactory,
    transport: Arc<dyn Transport>,
}

impl Agent {
    /// Start with the transport the configuration selects
    ///
    /// `non_standalone` picks the inherited local channel, otherwise the
    /// remote socket. Must be called from within a Tokio runtime.
    pub fn start(config: AgentConfig, registry: Arc<ActionRegistry>) -> Result<Self> {
        Self::with_factory(config, registry, Box::new(default_transport))
    }

    /// Start with a caller-supplied transport factory
    pub fn with_factory(
        config: AgentConfig,
        registry: Arc<ActionRegistry>,
        factory: TransportFactory,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Arc::new(
            Dispatcher::new(registry)
                .with_action_timeout(config.timing.action_timeout())
                .with_max_in_flight(config.timing.max_in_flight_actions),
        );
        let transport = launch(&factory, &config, &dispatcher)?;

        Ok(Self {
            config,
            dispatcher,
            factory,
            transport,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        self.dispatcher.registry()
    }

    /// Active transport
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send `data` on `channel` through the active transport
    pub fn send(&self, channel: &str, data: serde_json::Value) {
        self.transport.send(channel, data);
    }

    /// Send a status report
    ///
    /// Processes that list no actions are given the registry's catalogue.
    pub fn send_status(&self, mut status: Status) {
        let descriptors = self.registry().descriptors();
        for process in &mut status.process {
            if process.axm_actions.is_empty() {
                process.axm_actions = descriptors.clone();
            }
        }

        match serde_json::to_value(&status) {
            Ok(value) => self.transport.send(channels::STATUS, value),
            Err(e) => tracing::warn!(error = %e, "Failed to encode status"),
        }
    }

    /// Shut the active transport down and start a fresh one
    pub async fn restart_transport(&mut self) -> Result<()> {
        tracing::info!(transport = self.transport.name(), "Restarting transport");
        self.transport.shutdown().await;
        self.transport = launch(&self.factory, &self.config, &self.dispatcher)?;
        Ok(())
    }

    /// Stop the active transport
    pub async fn shutdown(self) {
        self.transport.shutdown().await;
        tracing::info!("Agent stopped");
    }
}

fn launch(
    factory: &TransportFactory,
    config: &AgentConfig,
    dispatcher: &Arc<Dispatcher>,
) -> Result<Arc<dyn Transport>> {
    let transport = factory(config, Arc::clone(dispatcher))?;
    transport.start();
    transport.connect();
    tracing::info!(transport = transport.name(), "Transport started");
    Ok(transport)
}

fn default_transport(config: &AgentConfig, dispatcher: Arc<Dispatcher>) -> Result<Arc<dyn Transport>> {
    if config.non_standalone {
        let local = LocalTransport::from_env(config.clone(), dispatcher).map_err(|e| {
            TransportError::Config(format!("Non-standalone mode needs an IPC channel: {}", e))
        })?;
        return Ok(Arc::new(local));
    }
    Ok(Arc::new(RemoteTransport::new(config.clone(), dispatcher)?))
}
