//! Endpoint resolution against the directory service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::{Result, TransportError};
use crate::host::HostFacts;

/// Yields the socket endpoint the agent should connect to
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    public_id: String,
    private_id: String,
    data: VerifyData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyData {
    machine_name: String,
    cpus: usize,
    memory: u64,
    pm2_version: String,
    hostname: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    endpoints: Endpoints,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    #[serde(default)]
    ws: String,
}

/// Resolver that POSTs the agent identity to `verifyPM2`
pub struct HttpEndpointResolver {
    client: reqwest::Client,
    url: String,
    request: VerifyRequest,
}

impl HttpEndpointResolver {
    pub fn new(config: &AgentConfig, host: &HostFacts) -> Result<Self> {
        Self::with_url(config, host, config.verify_url())
    }

    /// Resolver pointed at an explicit verification URL
    pub fn with_url(config: &AgentConfig, host: &HostFacts, url: impl Into<String>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(config.timing.resolve_timeout());
        if let Some(proxy) = config.proxy_url() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Config(format!("Invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let hostname = if config.hostname.is_empty() {
            host.hostname.clone()
        } else {
            config.hostname.clone()
        };

        Ok(Self {
            client,
            url: url.into(),
            request: VerifyRequest {
                public_id: config.public_key.clone(),
                private_id: config.private_key.clone(),
                data: VerifyData {
                    machine_name: config.server_name.clone(),
                    cpus: host.cpus,
                    memory: host.memory,
                    pm2_version: config.version.clone(),
                    hostname,
                },
            },
        })
    }
}

#[async_trait]
impl EndpointResolver for HttpEndpointResolver {
    async fn resolve(&self) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.request)
            .send()
            .await
            .map_err(|e| TransportError::Resolve(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Resolve(format!(
                "directory returned {}",
                response.status()
            )));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Resolve(format!("incorrect response: {}", e)))?;
        if body.endpoints.ws.is_empty() {
            return Err(TransportError::Resolve(
                "response carries no websocket endpoint".to_string(),
            ));
        }
        Ok(body.endpoints.ws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn host() -> HostFacts {
        HostFacts {
            cpus: 4,
            memory: 8 * 1024 * 1024 * 1024,
            hostname: "box".to_string(),
            internal_ip: "10.0.0.2".to_string(),
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            public_key: "pub".to_string(),
            private_key: "priv".to_string(),
            server_name: "web-1".to_string(),
            version: "5.3.0".to_string(),
            ..Default::default()
        }
    }

    fn content_length(line: &str) -> Option<usize> {
        let lower = line.to_ascii_lowercase();
        lower.strip_prefix("content-length:")?.trim().parse().ok()
    }

    /// Serve one canned HTTP response, returning the raw request received
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/node/verifyPM2", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(content_length)
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_verify_request_shape() {
        let resolver = HttpEndpointResolver::new(&config(), &host()).unwrap();
        assert_eq!(resolver.url, "https://api.cloud.pm2.io/api/node/verifyPM2");

        let body = serde_json::to_value(&resolver.request).unwrap();
        assert_eq!(body["publicId"], "pub");
        assert_eq!(body["privateId"], "priv");
        assert_eq!(body["data"]["machineName"], "web-1");
        assert_eq!(body["data"]["cpus"], 4);
        assert_eq!(body["data"]["pm2Version"], "5.3.0");
        assert_eq!(body["data"]["hostname"], "box");
    }

    #[tokio::test]
    async fn test_resolve_returns_ws_endpoint() {
        let (url, server) =
            serve_once("200 OK", r#"{"endpoints":{"ws":"wss://eu1.pm2.io"}}"#).await;
        let resolver = HttpEndpointResolver::with_url(&config(), &host(), url).unwrap();

        assert_eq!(resolver.resolve().await.unwrap(), "wss://eu1.pm2.io");
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/node/verifyPM2"));
        assert!(request.contains("\"publicId\":\"pub\""));
    }

    #[tokio::test]
    async fn test_resolve_rejects_error_status() {
        let (url, _server) = serve_once("500 Internal Server Error", "{}").await;
        let resolver = HttpEndpointResolver::with_url(&config(), &host(), url).unwrap();
        assert!(matches!(
            resolver.resolve().await,
            Err(TransportError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_rejects_malformed_body() {
        let (url, _server) = serve_once("200 OK", r#"{"unexpected":true}"#).await;
        let resolver = HttpEndpointResolver::with_url(&config(), &host(), url).unwrap();
        let err = resolver.resolve().await.unwrap_err();
        assert!(err.to_string().contains("incorrect response"));
    }
}
