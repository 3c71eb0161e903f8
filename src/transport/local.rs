//! Local channel transport.
//!
//! Exchanges newline-delimited envelopes over a byte stream inherited from
//! a supervising parent process. The channel is open from construction and
//! lives as long as the parent; there is nothing to reconnect to, so end of
//! stream is final for this transport instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{spawn_dispatch, ReplySink, Transport};
use crate::codec::{fan_out_status, LineReader, WireFormat};
use crate::config::{AgentConfig, CHANNEL_FD_ENV};
use crate::dispatch::Dispatcher;
use crate::error::{Result, TransportError};
use crate::types::{channels, Envelope, Status};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport over an inherited inter-process byte stream
pub struct LocalTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    closed: AtomicBool,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    halves: Mutex<Option<(BoxReader, BoxWriter, mpsc::UnboundedReceiver<Vec<u8>>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTransport {
    /// Create a transport over already-open stream halves
    pub fn new<R, W>(reader: R, writer: W, config: AgentConfig, dispatcher: Arc<Dispatcher>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                closed: AtomicBool::new(false),
                outbox: tx,
                halves: Mutex::new(Some((Box::new(reader), Box::new(writer), rx))),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the channel named by `NODE_CHANNEL_FD`
    ///
    /// The inherited descriptor itself is never adopted. Each call wraps a
    /// fresh duplicate, so shutting this transport down leaves the channel
    /// open for the next one. Must be called from within a Tokio runtime.
    #[cfg(unix)]
    pub fn from_env(config: AgentConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        use std::os::fd::{BorrowedFd, RawFd};

        let raw = std::env::var(CHANNEL_FD_ENV).map_err(|_| {
            TransportError::Config("Cannot find node IPC channel".to_string())
        })?;
        let fd: RawFd = raw
            .trim()
            .parse()
            .ok()
            .filter(|fd: &RawFd| *fd >= 0)
            .ok_or_else(|| {
                TransportError::Config(format!("{} is not a descriptor: {}", CHANNEL_FD_ENV, raw))
            })?;

        // SAFETY: the descriptor belongs to the process for its whole
        // lifetime and this crate never closes it; it is only borrowed
        // long enough to duplicate it. A number that is not open makes
        // the duplication fail with EBADF.
        let inherited = unsafe { BorrowedFd::borrow_raw(fd) };
        tracing::info!(fd, "Using inherited IPC channel");
        Self::from_fd(inherited, config, dispatcher)
    }

    /// Open a channel on a duplicate of `fd`
    ///
    /// The caller keeps ownership of `fd`; the transport closes only its
    /// own copy on shutdown.
    #[cfg(unix)]
    pub fn from_fd(
        fd: std::os::fd::BorrowedFd<'_>,
        config: AgentConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let owned = fd.try_clone_to_owned()?;
        let std_stream = std::os::unix::net::UnixStream::from(owned);
        std_stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(std_stream)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer, config, dispatcher))
    }

    #[cfg(not(unix))]
    pub fn from_env(_config: AgentConfig, _dispatcher: Arc<Dispatcher>) -> Result<Self> {
        Err(TransportError::Config(format!(
            "{} is only supported on unix platforms",
            CHANNEL_FD_ENV
        )))
    }
}

impl Inner {
    fn enqueue(&self, frame: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!("Local channel closed, dropping frame");
            return;
        }
        // Receiver only disappears once the writer has stopped
        let _ = self.outbox.send(frame);
    }

    fn send_envelope(&self, envelope: &Envelope) {
        match WireFormat::Line.encode(envelope) {
            Ok(frame) => self.enqueue(frame),
            Err(e) => tracing::warn!(channel = %envelope.channel, error = %e, "Failed to encode envelope"),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn run_reader(self: Arc<Self>, reader: BoxReader) {
        let mut lines = LineReader::new(reader);
        loop {
            match lines.read_line().await {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    spawn_dispatch(
                        Arc::clone(&self),
                        Arc::clone(&self.dispatcher),
                        WireFormat::Line,
                        line,
                    );
                }
                Ok(None) => {
                    tracing::info!("IPC channel closed by parent");
                    break;
                }
                Err(TransportError::InvalidFrame(reason)) => {
                    tracing::warn!(reason = %reason, "Skipping oversized IPC frame");
                }
                Err(e) => {
                    tracing::error!(error = %e, "IPC channel read failed");
                    break;
                }
            }
        }
        self.mark_closed();
    }

    async fn run_writer(
        self: Arc<Self>,
        mut writer: BoxWriter,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = rx.recv().await {
            let result = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                tracing::warn!(error = %e, "IPC channel write failed");
                self.mark_closed();
                break;
            }
        }
    }
}

impl ReplySink for Inner {
    fn send(&self, channel: &str, data: serde_json::Value) {
        if channel != channels::STATUS {
            self.send_envelope(&Envelope::new(channel, data));
            return;
        }

        let envelopes = serde_json::from_value::<Status>(data)
            .map_err(TransportError::from)
            .and_then(|status| fan_out_status(&status));
        match envelopes {
            Ok(envelopes) if envelopes.is_empty() => {
                tracing::warn!("Status without processes, nothing sent");
            }
            Ok(envelopes) => {
                for envelope in &envelopes {
                    self.send_envelope(envelope);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Malformed status payload, nothing sent"),
        }
    }

    fn send_json(&self, message: serde_json::Value) {
        match WireFormat::Line.encode_raw(&message) {
            Ok(frame) => self.enqueue(frame),
            Err(e) => tracing::warn!(error = %e, "Failed to encode message"),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// The channel is open from construction
    fn connect(&self) {}

    fn start(&self) {
        let Some((reader, writer, rx)) = self.inner.halves.lock().ok().and_then(|mut h| h.take())
        else {
            return;
        };

        let reader_task = tokio::spawn(Arc::clone(&self.inner).run_reader(reader));
        let writer_task = tokio::spawn(Arc::clone(&self.inner).run_writer(writer, rx));
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(reader_task);
            tasks.push(writer_task);
        }
    }

    fn send(&self, channel: &str, data: serde_json::Value) {
        ReplySink::send(self.inner.as_ref(), channel, data);
    }

    fn send_json(&self, message: serde_json::Value) {
        ReplySink::send_json(self.inner.as_ref(), message);
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Nothing to reconnect to; the parent owns the channel
    fn close_and_reconnect(&self) {
        tracing::debug!("close_and_reconnect ignored on local channel");
    }

    async fn shutdown(&self) {
        self.inner.mark_closed();
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
