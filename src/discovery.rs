//! Service discovery registration
//!
//! Each service listener is announced once, right after it binds. Cold starts
//! and idle stops are invisible to discovery: the listener address never
//! changes while the process runs.

use crate::config::DiscoveryConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A service listener announced to discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub service: String,
    pub host: String,
    pub port: u16,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, service: &str, host: &str, port: u16) -> Result<()>;
}

pub type SharedDiscovery = Arc<dyn Discovery>;

/// Pick the discovery backend for `config`
pub fn from_config(config: &DiscoveryConfig) -> Result<SharedDiscovery> {
    match &config.register_url {
        Some(url) => Ok(Arc::new(HttpDiscovery::new(url)?)),
        None => Ok(Arc::new(LogDiscovery::default())),
    }
}

/// Records registrations in memory and logs them
#[derive(Debug, Default)]
pub struct LogDiscovery {
    registrations: Mutex<Vec<Registration>>,
}

impl LogDiscovery {
    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().clone()
    }
}

#[async_trait]
impl Discovery for LogDiscovery {
    async fn register(&self, service: &str, host: &str, port: u16) -> Result<()> {
        info!(service, host, port, "Registered service listener");
        self.registrations.lock().push(Registration {
            service: service.to_string(),
            host: host.to_string(),
            port,
        });
        Ok(())
    }
}

/// POSTs each registration as JSON to a fixed URL
pub struct HttpDiscovery {
    http_client: reqwest::Client,
    url: String,
}

impl HttpDiscovery {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn register(&self, service: &str, host: &str, port: u16) -> Result<()> {
        let registration = Registration {
            service: service.to_string(),
            host: host.to_string(),
            port,
        };

        let response = self
            .http_client
            .post(&self.url)
            .header("User-Agent", concat!("zerogate/", env!("CARGO_PKG_VERSION")))
            .json(&registration)
            .send()
            .await
            .map_err(|e| anyhow!("Discovery request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Discovery returned error: {} - {}", status, body));
        }

        debug!(url = %self.url, service, port, "Registered with discovery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_log_discovery_records() {
        let discovery = LogDiscovery::default();
        discovery.register("echo", "127.0.0.1", 9000).await.unwrap();
        discovery.register("other", "127.0.0.1", 9001).await.unwrap();

        let registrations = discovery.registrations();
        assert_eq!(registrations.len(), 2);
        assert_eq!(
            registrations[0],
            Registration {
                service: "echo".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9000,
            }
        );
    }

    #[test]
    fn test_registration_serialization() {
        let registration = Registration {
            service: "echo".to_string(),
            host: "10.0.0.1".to_string(),
            port: 9000,
        };
        let json = serde_json::to_string(&registration).unwrap();
        assert_eq!(json, r#"{"service":"echo","host":"10.0.0.1","port":9000}"#);
    }

    /// Accept one request, answer with `status_line` and return what was received
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/register", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if n == 0 || (text.contains("\"port\":") && text.ends_with('}')) {
                    break;
                }
            }
            let response = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_http_discovery_posts_json() {
        let (url, server) = one_shot_server("HTTP/1.1 204 No Content").await;
        let discovery = HttpDiscovery::new(url).unwrap();

        discovery.register("echo", "127.0.0.1", 9000).await.unwrap();

        let received = server.await.unwrap();
        assert!(received.starts_with("POST /register"));
        assert!(received.contains(r#""service":"echo""#));
        assert!(received.contains(r#""port":9000"#));
    }

    #[tokio::test]
    async fn test_http_discovery_error_status() {
        let (url, server) = one_shot_server("HTTP/1.1 500 Internal Server Error").await;
        let discovery = HttpDiscovery::new(url).unwrap();

        let err = discovery.register("echo", "127.0.0.1", 9000).await.unwrap_err();
        assert!(err.to_string().contains("500"));
        server.await.unwrap();
    }

    #[test]
    fn test_from_config_selects_backend() {
        let config = DiscoveryConfig::default();
        assert!(config.register_url.is_none());
        assert!(from_config(&config).is_ok());

        let config = DiscoveryConfig {
            register_url: Some("http://127.0.0.1:1/register".to_string()),
            ..Default::default()
        };
        assert!(from_config(&config).is_ok());
    }
}
