//! In-memory resolver and connector for exercising the remote transport
//!
//! Every dial produces a [`MockSession`] the test can inspect: frames the
//! transport wrote, inbound frames to inject, and a switch to make writes
//! fail. Useful with a paused Tokio clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::resolver::EndpointResolver;
use super::socket::{Connection, Handshake, SocketConnector, SocketSink, SocketSource};
use crate::error::{Result, TransportError};

/// Resolver answering from a script, then from a current endpoint
#[derive(Default)]
pub struct MockResolver {
    script: Mutex<VecDeque<Option<String>>>,
    current: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl MockResolver {
    /// Always resolves to `endpoint`
    pub fn fixed(endpoint: impl Into<String>) -> Self {
        let resolver = Self::default();
        resolver.set_endpoint(endpoint);
        resolver
    }

    /// Change the endpoint returned once the script is exhausted
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(endpoint.into());
        }
    }

    /// Fail the next `count` resolutions
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(std::iter::repeat(None).take(count));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointResolver for MockResolver {
    async fn resolve(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let answer = match scripted {
            Some(answer) => answer,
            None => self.current.lock().ok().and_then(|c| c.clone()),
        };
        answer.ok_or_else(|| TransportError::Resolve("mock resolution failure".to_string()))
    }
}

/// Frame written by the transport to a mock socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Text(String),
    Ping,
    Close,
}

/// One socket opened through [`MockConnector`]
pub struct MockSession {
    pub endpoint: String,
    pub handshake: Handshake,
    sent: Arc<Mutex<Vec<SentFrame>>>,
    fail_writes: Arc<AtomicBool>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<String>>>>,
}

impl MockSession {
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Text frames parsed as JSON
    pub fn texts(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                SentFrame::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.sent().iter().filter(|f| **f == SentFrame::Ping).count()
    }

    pub fn was_closed(&self) -> bool {
        self.sent().contains(&SentFrame::Close)
    }

    /// Make every subsequent write or ping on this socket fail
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Deliver a frame as if the server had sent it
    pub fn push_inbound(&self, text: impl Into<String>) {
        if let Ok(guard) = self.inbound.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(Ok(text.into()));
            }
        }
    }

    /// Deliver a read error
    pub fn push_error(&self, error: TransportError) {
        if let Ok(guard) = self.inbound.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(Err(error));
            }
        }
    }

    /// Close the socket from the server side
    pub fn close_from_peer(&self) {
        if let Ok(mut guard) = self.inbound.lock() {
            guard.take();
        }
    }
}

/// Connector opening in-memory sockets
#[derive(Default)]
pub struct MockConnector {
    fail_next: AtomicUsize,
    dial_delay: Mutex<Duration>,
    dials: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` dials
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Hold each dial open for `delay` before answering
    pub fn set_dial_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.dial_delay.lock() {
            *d = delay;
        }
    }

    /// Dial attempts, successful or not
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Highest number of dials observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Sockets opened so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions().pop()
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, endpoint: &str, handshake: &Handshake) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = self.dial_delay.lock().map(|d| *d).unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::Dial {
                endpoint: endpoint.to_string(),
                reason: "mock dial failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession {
            endpoint: endpoint.to_string(),
            handshake: handshake.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            inbound: Mutex::new(Some(tx)),
        });
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(Arc::clone(&session));
        }

        Ok(Connection {
            sink: Box::new(MockSink {
                sent: Arc::clone(&session.sent),
                fail_writes: Arc::clone(&session.fail_writes),
            }),
            source: Box::new(MockSource { rx }),
        })
    }
}

struct MockSink {
    sent: Arc<Mutex<Vec<SentFrame>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockSink {
    fn record(&self, frame: SentFrame) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Send("mock write failure".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(frame);
        }
        Ok(())
    }
}

#[async_trait]
impl SocketSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.record(SentFrame::Text(text))
    }

    async fn ping(&mut self) -> Result<()> {
        self.record(SentFrame::Ping)
    }

    async fn close(&mut self) -> Result<()> {
        self.record(SentFrame::Close)
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl SocketSource for MockSource {
    async fn next_message(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}
