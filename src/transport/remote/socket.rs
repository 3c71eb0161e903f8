//! Socket connector abstraction and the websocket implementation
//!
//! The remote transport only sees [`SocketSink`] and [`SocketSource`]
//! halves produced by a [`SocketConnector`]. Production uses
//! [`WsConnector`]; tests plug in an in-memory connector.

use async_trait::async_trait;
use base64::Engine;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{AgentConfig, PROTOCOL_VERSION};
use crate::error::{Result, TransportError};

/// Limit on the proxy's CONNECT response head
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Identity headers sent when opening the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub public_key: String,
    pub secret_key: String,
    pub server_name: String,
    pub version: String,
    pub user_agent: String,
}

impl Handshake {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            public_key: config.public_key.clone(),
            secret_key: config.private_key.clone(),
            server_name: config.server_name.clone(),
            version: config.version.clone(),
            user_agent: config.user_agent(),
        }
    }

    /// Header pairs in the order they are sent
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-km-public", self.public_key.clone()),
            ("x-km-secret", self.secret_key.clone()),
            ("x-km-server", self.server_name.clone()),
            ("x-pm2-version", self.version.clone()),
            ("x-protocol-version", PROTOCOL_VERSION.to_string()),
            ("user-agent", self.user_agent.clone()),
        ]
    }
}

/// Write half of an open socket
#[async_trait]
pub trait SocketSink: Send {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Send a liveness ping
    async fn ping(&mut self) -> Result<()>;

    /// Send a close frame
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open socket
#[async_trait]
pub trait SocketSource: Send {
    /// Next text frame; `None` once the peer has closed the socket
    async fn next_message(&mut self) -> Option<Result<String>>;
}

/// Both halves of a freshly opened socket
pub struct Connection {
    pub sink: Box<dyn SocketSink>,
    pub source: Box<dyn SocketSource>,
}

/// Opens sockets to a resolved endpoint
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, endpoint: &str, handshake: &Handshake) -> Result<Connection>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connector with optional HTTP CONNECT proxy tunnelling
pub struct WsConnector {
    proxy: Option<reqwest::Url>,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            proxy: config.proxy_url(),
            connect_timeout: config.timing.write_deadline(),
        }
    }

    async fn open(&self, endpoint: &str, handshake: &Handshake) -> Result<WsStream> {
        let dial_err = |reason: String| TransportError::Dial {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| dial_err(e.to_string()))?;
        for (name, value) in handshake.headers() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| dial_err(format!("invalid {} header: {}", name, e)))?;
            request
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }

        let Some(proxy) = &self.proxy else {
            let (ws, _) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| dial_err(e.to_string()))?;
            return Ok(ws);
        };

        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| dial_err("endpoint has no host".to_string()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("wss") => 443,
            _ => 80,
        });

        let stream = tunnel(proxy, &host, port)
            .await
            .map_err(|e| dial_err(format!("proxy: {}", e)))?;
        let (ws, _) = tokio_tungstenite::client_async_tls(request, stream)
            .await
            .map_err(|e| dial_err(e.to_string()))?;
        Ok(ws)
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn connect(&self, endpoint: &str, handshake: &Handshake) -> Result<Connection> {
        let ws = tokio::time::timeout(self.connect_timeout, self.open(endpoint, handshake))
            .await
            .map_err(|_| TransportError::Timeout(format!("dial {}", endpoint)))??;

        tracing::debug!(endpoint = %endpoint, "Websocket opened");
        let (sink, source) = ws.split();
        Ok(Connection {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }
}

/// Open a TCP tunnel to `host:port` through an HTTP proxy
async fn tunnel(proxy: &reqwest::Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| TransportError::Connection("proxy URL has no host".to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let mut head = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        head.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;

    // Byte at a time so nothing past the response head is consumed
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::Connection(
                "proxy closed during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
        if response.len() > MAX_PROXY_RESPONSE {
            return Err(TransportError::Connection(
                "oversized proxy response".to_string(),
            ));
        }
    }

    let status_line = String::from_utf8_lossy(&response);
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(TransportError::Connection(format!(
            "proxy refused CONNECT with status {}",
            status
        )));
    }
    Ok(stream)
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(&mut self.inner)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl SocketSource for WsSource {
    async fn next_message(&mut self) -> Option<Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|e| {
                        TransportError::InvalidFrame(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(TransportError::Connection(e.to_string()))),
            }
        }
    }
}
