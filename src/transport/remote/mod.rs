//! Remote socket transport
//!
//! A single supervisor task owns the session lifecycle:
//!
//! ```text
//! Disconnected -> Resolving -> Connecting -> Connected
//!      ^             |            |             |
//!      +-- backoff --+-- backoff -+             |
//!      +---------- read/write/ping error -------+
//! Connected -> Closing (forced reconnect) -> Resolving
//! ```
//!
//! At most one connection attempt runs at a time. Frames are queued to a
//! writer task that holds the only handle to the socket's write half, so
//! writes never interleave. Heartbeat and refresh timers are armed on the
//! first successful connect and live as long as the transport.

pub mod mock;
pub mod resolver;
pub mod socket;

pub use resolver::{EndpointResolver, HttpEndpointResolver};
pub use socket::{Connection, Handshake, SocketConnector, SocketSink, SocketSource, WsConnector};

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{spawn_dispatch, ReplySink, Transport};
use crate::codec::WireFormat;
use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Result, TransportError};
use crate::host::HostFacts;
use crate::types::{Envelope, SessionState, SocketPayload};

/// Transport over a websocket to an endpoint chosen by the directory service
pub struct RemoteTransport {
    inner: Arc<Inner>,
}

struct Supervisor {
    state: SessionState,
    /// A supervise task is resolving or dialing
    in_flight: bool,
    /// Bumped on every successful connect; stale readers compare against it
    generation: u64,
    peer_closed: bool,
    shut_down: bool,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        let handles = [
            self.supervisor.take(),
            self.reader.take(),
            self.writer.take(),
            self.heartbeat.take(),
            self.refresh.take(),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
    }
}

struct Inner {
    config: AgentConfig,
    handshake: Handshake,
    internal_ip: String,
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn SocketConnector>,
    dispatcher: Arc<Dispatcher>,
    supervisor: Mutex<Supervisor>,
    endpoint: RwLock<Option<String>>,
    sink: tokio::sync::Mutex<Option<Box<dyn SocketSink>>>,
    outbox: mpsc::UnboundedSender<String>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Tasks>,
}

impl RemoteTransport {
    /// Transport wired to the directory service and a real websocket
    pub fn new(config: AgentConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        config.validate()?;
        let host = HostFacts::detect();
        let resolver = Arc::new(HttpEndpointResolver::new(&config, &host)?);
        let connector = Arc::new(WsConnector::new(&config));
        Ok(Self::with_parts(
            config,
            dispatcher,
            resolver,
            connector,
            host.internal_ip,
        ))
    }

    /// Transport over caller-supplied resolver and connector
    pub fn with_parts(
        config: AgentConfig,
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn SocketConnector>,
        internal_ip: impl Into<String>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                handshake: Handshake::from_config(&config),
                config,
                internal_ip: internal_ip.into(),
                resolver,
                connector,
                dispatcher,
                supervisor: Mutex::new(Supervisor {
                    state: SessionState::Disconnected,
                    in_flight: false,
                    generation: 0,
                    peer_closed: false,
                    shut_down: false,
                }),
                endpoint: RwLock::new(None),
                sink: tokio::sync::Mutex::new(None),
                outbox: tx,
                outbox_rx: Mutex::new(Some(rx)),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.supervisor().state
    }
}

impl Inner {
    fn supervisor(&self) -> MutexGuard<'_, Supervisor> {
        self.supervisor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let mut sup = self.supervisor();
        tracing::trace!(from = %sup.state, to = %state, "Session state change");
        sup.state = state;
    }

    fn is_connected(&self) -> bool {
        self.supervisor().state == SessionState::Connected
    }

    fn current_endpoint(&self) -> Option<String> {
        self.endpoint
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Store `endpoint`, returning whether it differs from the previous one
    fn replace_endpoint(&self, endpoint: String) -> bool {
        let mut current = self.endpoint.write().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(endpoint.as_str()) {
            return false;
        }
        *current = Some(endpoint);
        true
    }

    /// Start a supervise task unless one is already running
    ///
    /// Without `force`, an established session is left alone.
    fn begin_connect(this: &Arc<Self>, force: bool) {
        {
            let mut sup = this.supervisor();
            if sup.shut_down {
                return;
            }
            if sup.in_flight {
                tracing::debug!(state = %sup.state, "Connection attempt already in flight");
                return;
            }
            if sup.state == SessionState::Connected {
                if !force {
                    return;
                }
                sup.state = SessionState::Closing;
            }
            sup.in_flight = true;
        }

        Self::ensure_writer(this);
        let handle = tokio::spawn(Self::supervise(Arc::clone(this)));
        this.tasks().supervisor = Some(handle);
    }

    fn ensure_writer(this: &Arc<Self>) {
        let mut tasks = this.tasks();
        if tasks.writer.is_some() {
            return;
        }
        let rx = this
            .outbox_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = rx {
            tasks.writer = Some(tokio::spawn(Self::run_writer(Arc::clone(this), rx)));
        }
    }

    async fn supervise(this: Arc<Self>) {
        this.teardown().await;

        let timing = &this.config.timing;
        let mut resolve_failures = 0u32;
        let mut dial_failures = 0u32;

        loop {
            if this.supervisor().shut_down {
                return;
            }

            this.set_state(SessionState::Resolving);
            let endpoint = match this.current_endpoint() {
                Some(endpoint) => endpoint,
                None => match this.resolver.resolve().await {
                    Ok(endpoint) => {
                        tracing::info!(endpoint = %endpoint, "Resolved socket endpoint");
                        this.replace_endpoint(endpoint.clone());
                        endpoint
                    }
                    Err(e) => {
                        let delay = timing.resolve_backoff.delay(resolve_failures);
                        resolve_failures = resolve_failures.saturating_add(1);
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Cannot resolve endpoint, retrying"
                        );
                        this.set_state(SessionState::Disconnected);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            this.set_state(SessionState::Connecting);
            match this.connector.connect(&endpoint, &this.handshake).await {
                Ok(connection) => {
                    Self::install(&this, endpoint, connection).await;
                    return;
                }
                Err(e) => {
                    // The endpoint stays cached; only refresh replaces it
                    let delay = timing.dial_backoff.delay(dial_failures);
                    dial_failures = dial_failures.saturating_add(1);
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to open socket, retrying"
                    );
                    this.set_state(SessionState::Disconnected);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Adopt a freshly opened socket as the current session
    async fn install(this: &Arc<Self>, endpoint: String, connection: Connection) {
        let Connection { mut sink, source } = connection;
        if this.supervisor().shut_down {
            let _ = sink.close().await;
            return;
        }

        *this.sink.lock().await = Some(sink);
        let generation = {
            let mut sup = this.supervisor();
            sup.generation += 1;
            sup.state = SessionState::Connected;
            sup.in_flight = false;
            sup.peer_closed = false;
            sup.generation
        };
        tracing::info!(endpoint = %endpoint, generation, "Connected to remote endpoint");

        let reader = tokio::spawn(Self::run_reader(Arc::clone(this), generation, source));
        let mut tasks = this.tasks();
        tasks.reader = Some(reader);
        if tasks.heartbeat.is_none() {
            tasks.heartbeat = Some(tokio::spawn(Self::run_heartbeat(Arc::clone(this))));
        }
        if tasks.refresh.is_none() {
            tasks.refresh = Some(tokio::spawn(Self::run_refresh(Arc::clone(this))));
        }
    }

    /// Stop the old reader and close the old socket unless the peer did
    async fn teardown(&self) {
        let reader = self.tasks().reader.take();
        if let Some(reader) = reader {
            reader.abort();
        }

        let peer_closed = self.supervisor().peer_closed;
        let old = self.sink.lock().await.take();
        let Some(mut sink) = old else {
            return;
        };
        if peer_closed {
            return;
        }
        match tokio::time::timeout(self.config.timing.write_deadline(), sink.close()).await {
            Ok(Ok(())) => tracing::debug!("Closed previous socket"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Error closing previous socket"),
            Err(_) => tracing::debug!("Timed out closing previous socket"),
        }
    }

    /// Mark the session lost and reconnect, unless it was already replaced
    fn session_lost(this: &Arc<Self>, generation: u64, peer_closed: bool) {
        {
            let mut sup = this.supervisor();
            if sup.generation != generation || sup.state != SessionState::Connected {
                return;
            }
            sup.state = SessionState::Disconnected;
            sup.peer_closed = peer_closed;
        }
        Self::begin_connect(this, false);
    }

    async fn run_reader(this: Arc<Self>, generation: u64, mut source: Box<dyn SocketSource>) {
        loop {
            match source.next_message().await {
                Some(Ok(text)) => spawn_dispatch(
                    Arc::clone(&this),
                    Arc::clone(&this.dispatcher),
                    WireFormat::Socket,
                    text.into_bytes(),
                ),
                Some(Err(TransportError::InvalidFrame(reason))) => {
                    tracing::warn!(reason = %reason, "Skipping malformed socket frame");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Socket read failed");
                    Self::session_lost(&this, generation, false);
                    return;
                }
                None => {
                    tracing::info!("Socket closed by peer");
                    Self::session_lost(&this, generation, true);
                    return;
                }
            }
        }
    }

    async fn run_writer(this: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = rx.recv().await {
            if !this.is_connected() {
                tracing::debug!("Not connected, dropping queued frame");
                continue;
            }
            if let Err(e) = this.write(text).await {
                tracing::warn!(error = %e, "Socket write failed, reconnecting");
                Self::begin_connect(&this, true);
            }
        }
    }

    async fn write(&self, text: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        tokio::time::timeout(self.config.timing.write_deadline(), sink.send_text(text))
            .await
            .map_err(|_| TransportError::Timeout("socket write".to_string()))?
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        tokio::time::timeout(self.config.timing.write_deadline(), sink.ping())
            .await
            .map_err(|_| TransportError::Timeout("heartbeat".to_string()))?
    }

    async fn run_heartbeat(this: Arc<Self>) {
        let period = this.config.timing.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !this.is_connected() {
                continue;
            }
            match this.ping().await {
                Ok(()) => tracing::trace!("Heartbeat sent"),
                Err(TransportError::NotConnected) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Heartbeat failed, reconnecting");
                    Self::begin_connect(&this, true);
                }
            }
        }
    }

    async fn run_refresh(this: Arc<Self>) {
        let period = this.config.timing.refresh_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match this.resolver.resolve().await {
                Ok(endpoint) => {
                    if this.replace_endpoint(endpoint.clone()) {
                        tracing::info!(endpoint = %endpoint, "Endpoint changed, reconnecting");
                        Self::begin_connect(&this, true);
                    } else {
                        tracing::debug!("Endpoint unchanged");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Endpoint refresh failed, keeping current endpoint");
                }
            }
        }
    }

    fn enqueue(&self, frame: Vec<u8>) {
        match String::from_utf8(frame) {
            Ok(text) => {
                // Receiver only disappears on shutdown
                let _ = self.outbox.send(text);
            }
            Err(e) => tracing::warn!(error = %e, "Encoded frame is not UTF-8"),
        }
    }
}

impl ReplySink for Inner {
    fn send(&self, channel: &str, data: serde_json::Value) {
        if !self.is_connected() {
            tracing::trace!(channel = %channel, "Not connected, dropping message");
            return;
        }

        let payload = SocketPayload::new(
            data,
            &self.config.name,
            &self.config.server_name,
            &self.internal_ip,
        );
        let frame = serde_json::to_value(&payload)
            .map_err(TransportError::from)
            .and_then(|payload| WireFormat::Socket.encode(&Envelope::new(channel, payload)));
        match frame {
            Ok(frame) => self.enqueue(frame),
            Err(e) => tracing::warn!(channel = %channel, error = %e, "Failed to encode message"),
        }
    }

    fn send_json(&self, message: serde_json::Value) {
        if !self.is_connected() {
            tracing::trace!("Not connected, dropping message");
            return;
        }
        match WireFormat::Socket.encode_raw(&message) {
            Ok(frame) => self.enqueue(frame),
            Err(e) => tracing::warn!(error = %e, "Failed to encode message"),
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    fn name(&self) -> &str {
        "remote"
    }

    fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    fn connect(&self) {
        Inner::begin_connect(&self.inner, false);
    }

    fn send(&self, channel: &str, data: serde_json::Value) {
        ReplySink::send(self.inner.as_ref(), channel, data);
    }

    fn send_json(&self, message: serde_json::Value) {
        ReplySink::send_json(self.inner.as_ref(), message);
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn close_and_reconnect(&self) {
        Inner::begin_connect(&self.inner, true);
    }

    fn endpoint(&self) -> Option<String> {
        self.inner.current_endpoint()
    }

    async fn shutdown(&self) {
        {
            let mut sup = self.inner.supervisor();
            sup.shut_down = true;
            sup.state = SessionState::Closing;
        }

        let writer = {
            let mut tasks = self.inner.tasks();
            let writer = tasks.writer.take();
            tasks.abort_all();
            writer
        };
        self.inner.teardown().await;
        if let Some(writer) = writer {
            writer.abort();
        }

        {
            let mut sup = self.inner.supervisor();
            sup.state = SessionState::Disconnected;
            sup.in_flight = false;
        }
        tracing::info!("Remote transport shut down");
    }
}

impl Drop for RemoteTransport {
    fn drop(&mut self) {
        self.inner.supervisor().shut_down = true;
        self.inner.tasks().abort_all();
    }
}
