//! Connection pool for backend HTTP connections
//!
//! Forwards a request to a resolved backend address over a pooled hyper
//! client, rewriting the URI and copying headers.

use crate::catalog::Address;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Request headers never copied to the backend
pub const EXCLUDED_HEADERS: [HeaderName; 3] = [HOST, CONTENT_LENGTH, CONNECTION];

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl PoolError {
    /// Whether the backend could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
    /// Headers dropped because they could not be copied
    pub dropped_headers: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_header(&self) {
        self.dropped_headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_dropped_headers(&self) -> u64 {
        self.dropped_headers.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Copy headers for a backend request, skipping [`EXCLUDED_HEADERS`].
///
/// Entries whose name or value is not valid HTTP are logged and dropped.
/// Returns the copied headers and the number dropped.
pub fn copy_headers<'a, I>(headers: I) -> (HeaderMap, usize)
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut copied = HeaderMap::new();
    let mut dropped = 0;

    for (name, value) in headers {
        let name = match HeaderName::from_bytes(name) {
            Ok(name) => name,
            Err(e) => {
                warn!(header = %String::from_utf8_lossy(name), error = %e, "Dropping header with invalid name");
                dropped += 1;
                continue;
            }
        };
        if EXCLUDED_HEADERS.contains(&name) {
            continue;
        }
        match HeaderValue::from_bytes(value) {
            Ok(value) => {
                copied.append(name, value);
            }
            Err(e) => {
                warn!(header = %name, error = %e, "Dropping header with invalid value");
                dropped += 1;
            }
        }
    }

    (copied, dropped)
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `address`, keeping method, path, query and body
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        address: &Address,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", address, path_and_query);

        let (parts, body) = req.into_parts();
        let (headers, dropped) = copy_headers(
            parts
                .headers
                .iter()
                .map(|(k, v)| (k.as_str().as_bytes(), v.as_bytes())),
        );
        for _ in 0..dropped {
            self.stats.record_dropped_header();
        }

        let mut backend_req = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = headers;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_dropped_header();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
        assert_eq!(stats.get_dropped_headers(), 1);
    }

    #[test]
    fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
        assert_eq!(pool.stats().get_total_requests(), 0);
    }

    #[test]
    fn test_copy_headers_skips_excluded() {
        let input: Vec<(&[u8], &[u8])> = vec![
            (b"host", b"example.com"),
            (b"content-length", b"12"),
            (b"connection", b"keep-alive"),
            (b"x-custom", b"kept"),
            (b"accept", b"text/plain"),
        ];
        let (headers, dropped) = copy_headers(input);

        assert_eq!(dropped, 0);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert!(headers.get("host").is_none());
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("connection").is_none());
    }

    #[test]
    fn test_copy_headers_drops_invalid_entries() {
        let input: Vec<(&[u8], &[u8])> = vec![
            (b"bad header", b"v"),
            (b"x-bad-value", b"line\nbreak"),
            (b"x-ok", b"fine"),
        ];
        let (headers, dropped) = copy_headers(input);

        assert_eq!(dropped, 2);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-ok").unwrap(), "fine");
    }

    #[test]
    fn test_copy_headers_keeps_repeated_values() {
        let input: Vec<(&[u8], &[u8])> = vec![(b"x-multi", b"a"), (b"x-multi", b"b")];
        let (headers, _) = copy_headers(input);
        let values: Vec<&str> = headers
            .get_all("x-multi")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }
}
