//! Liveness and status endpoint

use crate::pool::PoolStats;
use crate::registry::InstanceRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// What `/status` reports on
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<InstanceRegistry>,
    pub listener_ports: Arc<BTreeMap<String, u16>>,
    pub pool_stats: Arc<PoolStats>,
}

impl AdminState {
    fn status(&self) -> serde_json::Value {
        let now = Instant::now();
        let services: Vec<serde_json::Value> = self
            .registry
            .catalog()
            .all()
            .map(|def| {
                let idle_secs = self
                    .registry
                    .last_access(&def.name)
                    .map(|last| now.saturating_duration_since(last).as_secs());
                let address = def
                    .override_address
                    .clone()
                    .or_else(|| self.registry.address(&def.name))
                    .map(|a| a.to_string());
                serde_json::json!({
                    "name": def.name,
                    "listener_port": self.listener_ports.get(&def.name),
                    "address": address,
                    "running": self.registry.address(&def.name).is_some(),
                    "overridden": def.is_overridden(),
                    "idle_secs": idle_secs,
                })
            })
            .collect();

        serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "count": services.len(),
            "services": services,
            "pool": {
                "total_requests": self.pool_stats.get_total_requests(),
                "failed_requests": self.pool_stats.get_failed_requests(),
                "dropped_headers": self.pool_stats.get_dropped_headers(),
            },
        })
    }
}

/// Admin server answering liveness probes and status queries
pub struct AdminServer {
    listener: TcpListener,
    state: AdminState,
}

impl AdminServer {
    pub async fn bind(bind_addr: SocketAddr, state: AdminState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Admin server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: AdminState) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin request");

    let response = match (method, path) {
        // Liveness only, never touches the registry
        (&Method::GET, "/ok") => response(StatusCode::OK, "OK"),

        (&Method::GET, "/status") => json_response(StatusCode::OK, state.status().to_string()),

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
