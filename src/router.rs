//! Per-service HTTP listeners
//!
//! Every declared service gets its own listener. A request on that listener
//! resolves the service through the [`InstanceRegistry`], which may block
//! until a cold container is ready, and is then forwarded to the backend.

use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::ports::PortAllocator;
use crate::registry::InstanceRegistry;
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Listener and forwarding settings
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub bind: IpAddr,
    pub advertise_host: String,
    pub listener_port_start: u16,
    pub request_timeout: Duration,
    pub pool: PoolConfig,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let bind = config
            .server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;

        Ok(Self {
            bind,
            advertise_host: config.server.advertise_host.clone(),
            listener_port_start: config.server.listener_port_start,
            request_timeout: config.defaults.request_timeout(),
            pool: PoolConfig {
                max_idle_per_host: config.server.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
            },
        })
    }
}

struct ServiceListener {
    service: String,
    listener: TcpListener,
}

/// Bound listeners for every declared service
pub struct RequestRouter {
    registry: Arc<InstanceRegistry>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
    listeners: Vec<ServiceListener>,
    ports: BTreeMap<String, u16>,
}

impl RequestRouter {
    /// Bind one listener per catalog entry and announce each to discovery.
    ///
    /// Running out of listener ports is fatal. A failed discovery
    /// registration is logged and the listener is kept.
    pub async fn bind(
        registry: Arc<InstanceRegistry>,
        allocator: &PortAllocator,
        settings: RouterSettings,
        discovery: &dyn Discovery,
    ) -> anyhow::Result<Self> {
        let names: Vec<String> = registry.catalog().names().map(String::from).collect();
        let mut listeners = Vec::with_capacity(names.len());
        let mut ports = BTreeMap::new();

        for service in names {
            let (listener, port) =
                bind_listener(allocator, settings.bind, settings.listener_port_start)
                    .await
                    .with_context(|| format!("No listener port for service '{}'", service))?;

            info!(service = %service, addr = %SocketAddr::new(settings.bind, port), "Service listener bound");

            if let Err(e) = discovery
                .register(&service, &settings.advertise_host, port)
                .await
            {
                warn!(service = %service, error = %e, "Discovery registration failed");
            }

            ports.insert(service.clone(), port);
            listeners.push(ServiceListener { service, listener });
        }

        Ok(Self {
            registry,
            pool: Arc::new(ConnectionPool::new(settings.pool)),
            request_timeout: settings.request_timeout,
            listeners,
            ports,
        })
    }

    pub fn listener_port(&self, service: &str) -> Option<u16> {
        self.ports.get(service).copied()
    }

    /// Bound port per service
    pub fn listener_ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Serve every listener until shutdown is signalled
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let tasks: Vec<_> = self
            .listeners
            .into_iter()
            .map(|ServiceListener { service, listener }| {
                let ctx = ForwardContext {
                    service: Arc::from(service.as_str()),
                    registry: Arc::clone(&self.registry),
                    pool: Arc::clone(&self.pool),
                    request_timeout: self.request_timeout,
                };
                tokio::spawn(serve_listener(listener, ctx, shutdown_rx.clone()))
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Listener task failed");
            }
        }
    }
}

/// Allocate ports until one binds on `bind`
async fn bind_listener(
    allocator: &PortAllocator,
    bind: IpAddr,
    start: u16,
) -> crate::error::Result<(TcpListener, u16)> {
    loop {
        let port = allocator.allocate(start)?;
        match TcpListener::bind(SocketAddr::new(bind, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                // The port stays reserved so the next scan moves past it
                debug!(port, error = %e, "Port taken between probe and bind");
            }
        }
    }
}

/// Everything a request on one service listener needs
#[derive(Clone)]
struct ForwardContext {
    service: Arc<str>,
    registry: Arc<InstanceRegistry>,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

async fn serve_listener(listener: TcpListener, ctx: ForwardContext, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(service = %ctx.service, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(service = %ctx.service, "Service listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ForwardContext) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { handle_request(req, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    ctx: ForwardContext,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let service = &*ctx.service;

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    debug!(service, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let address = match ctx.registry.resolve(service).await {
        Ok(address) => address,
        Err(e) => {
            error!(service, request_id, error = %e, "Failed to resolve backend");
            return Ok(with_request_id(
                json_error_response(e.proxy_code(), e.to_string()),
                &request_id,
            ));
        }
    };

    let timeout = ctx.request_timeout;
    let response = match tokio::time::timeout(timeout, ctx.pool.send_request(req, &address)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(service, %address, request_id, error = %e, "Failed to forward request");
            let message = if e.is_connect() {
                "Failed to connect to backend"
            } else {
                "Backend request failed"
            };
            json_error_response(ProxyErrorCode::ConnectionFailed, message)
        }
        Err(_) => {
            warn!(
                service,
                %address,
                request_id,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            )
        }
    };

    Ok(with_request_id(response, &request_id))
}

fn with_request_id(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    request_id: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if !response.headers().contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    response
}
