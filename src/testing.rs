//! In-process container runtime for tests
//!
//! [`FakeRuntime`] implements [`ContainerRuntime`] without Docker. Starting a
//! fake container binds a real HTTP backend on the container's host port, so
//! the proxy path can be exercised end to end.
//!
//! Backend routes:
//! - `/echo`: `echo response`
//! - `/headers`: request headers as a JSON object
//! - `/slow`: answers after two seconds
//! - `/error`: `500`
//! - `/inspect`: method, path, query and body as a JSON object
//! - anything else: `Hello from <service> (<container id>)`

use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const FAKE_HOST: &str = "127.0.0.1";

struct FakeContainer {
    spec: ContainerSpec,
    server: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    last_specs: HashMap<String, ContainerSpec>,
    starts: HashMap<String, usize>,
    stops: HashMap<String, usize>,
    log_waits: HashMap<String, usize>,
    requests: HashMap<String, usize>,
    builds: usize,
    creates: usize,
    exposed_ports: BTreeSet<u16>,
    failing_creates: BTreeSet<String>,
    failing_stops: BTreeSet<String>,
    failing_starts: HashMap<String, usize>,
    silent: BTreeSet<String>,
    /// Connections to drop on accept, per service
    closing: HashMap<String, usize>,
    closed_connections: HashMap<String, usize>,
    log_streams: HashMap<String, watch::Receiver<bool>>,
}

/// Counting, failure-injecting stand-in for Docker
#[derive(Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
    start_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    next_id: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every start, widening the window for concurrent callers
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    /// Delay every stop, keeping a stop in flight
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    /// Accept and immediately close the next `count` connections to the
    /// backends of `service`, like a published port whose app is not up yet
    pub fn close_connections(&self, service: &str, count: usize) {
        self.state.lock().closing.insert(service.to_string(), count);
    }

    /// Make every create for `service` fail
    pub fn fail_create(&self, service: &str) {
        self.state.lock().failing_creates.insert(service.to_string());
    }

    /// Make the next `count` starts for `service` fail
    pub fn fail_next_starts(&self, service: &str, count: usize) {
        self.state
            .lock()
            .failing_starts
            .insert(service.to_string(), count);
    }

    /// Make every stop for `service` fail
    pub fn fail_stop(&self, service: &str) {
        self.state.lock().failing_stops.insert(service.to_string());
    }

    /// Never print a readiness line for `service`
    pub fn never_log(&self, service: &str) {
        self.state.lock().silent.insert(service.to_string());
    }

    pub fn start_count(&self, service: &str) -> usize {
        self.state.lock().starts.get(service).copied().unwrap_or(0)
    }

    pub fn stop_count(&self, service: &str) -> usize {
        self.state.lock().stops.get(service).copied().unwrap_or(0)
    }

    pub fn log_waits(&self, service: &str) -> usize {
        self.state.lock().log_waits.get(service).copied().unwrap_or(0)
    }

    /// Requests served by the backends of `service`
    pub fn request_count(&self, service: &str) -> usize {
        self.state.lock().requests.get(service).copied().unwrap_or(0)
    }

    /// Connections dropped because of [`close_connections`](Self::close_connections)
    pub fn closed_connections(&self, service: &str) -> usize {
        self.state
            .lock()
            .closed_connections
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// Whether the latest log stream of `service` was told to shut down
    pub fn log_stream_stopped(&self, service: &str) -> Option<bool> {
        self.state.lock().log_streams.get(service).map(|rx| *rx.borrow())
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().builds
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().creates
    }

    /// Containers created and not yet stopped
    pub fn live_containers(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn exposed_ports(&self) -> BTreeSet<u16> {
        self.state.lock().exposed_ports.clone()
    }

    /// Spec of the most recent create for `service`
    pub fn last_spec(&self, service: &str) -> Option<ContainerSpec> {
        self.state.lock().last_specs.get(service).cloned()
    }

    fn service_of(&self, handle: &ContainerHandle) -> anyhow::Result<String> {
        self.state
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.spec.service.clone())
            .ok_or_else(|| anyhow::anyhow!("No such container: {}", handle))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn host(&self) -> &str {
        FAKE_HOST
    }

    async fn build(&self, _context: &Path, tag: &str) -> anyhow::Result<String> {
        self.state.lock().builds += 1;
        Ok(tag.to_string())
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        let mut state = self.state.lock();
        state.creates += 1;
        state.last_specs.insert(spec.service.clone(), spec.clone());
        if state.failing_creates.contains(&spec.service) {
            anyhow::bail!("injected create failure for {}", spec.service);
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                server: None,
            },
        );
        Ok(ContainerHandle(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> anyhow::Result<()> {
        let service = self.service_of(handle)?;
        {
            let mut state = self.state.lock();
            *state.starts.entry(service.clone()).or_default() += 1;
            if let Some(remaining) = state.failing_starts.get_mut(&service) {
                if *remaining > 0 {
                    *remaining -= 1;
                    anyhow::bail!("injected start failure for {}", service);
                }
            }
        }

        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let host_port = {
            let state = self.state.lock();
            let container = state
                .containers
                .get(handle.id())
                .ok_or_else(|| anyhow::anyhow!("Container removed during start: {}", handle))?;
            container.spec.host_port
        };

        let listener = TcpListener::bind((FAKE_HOST, host_port)).await?;
        let server = tokio::spawn(serve_backend(
            listener,
            service,
            handle.id().to_string(),
            Arc::clone(&self.state),
        ));

        match self.state.lock().containers.get_mut(handle.id()) {
            Some(container) => container.server = Some(server),
            None => server.abort(),
        }
        Ok(())
    }

    async fn wait_for_log(&self, handle: &ContainerHandle, _pattern: &regex::Regex) -> anyhow::Result<()> {
        let service = self.service_of(handle)?;
        let silent = {
            let mut state = self.state.lock();
            *state.log_waits.entry(service.clone()).or_default() += 1;
            state.silent.contains(&service)
        };
        if silent {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> anyhow::Result<()> {
        let delay = *self.stop_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let Some(service) = state
            .containers
            .get(handle.id())
            .map(|c| c.spec.service.clone())
        else {
            return Ok(());
        };

        *state.stops.entry(service.clone()).or_default() += 1;
        if state.failing_stops.contains(&service) {
            anyhow::bail!("injected stop failure for {}", service);
        }

        if let Some(container) = state.containers.remove(handle.id()) {
            if let Some(server) = container.server {
                server.abort();
            }
        }
        debug!(service, container_id = %handle, "Fake container stopped");
        Ok(())
    }

    fn stream_logs(&self, _handle: &ContainerHandle, service: &str) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.state.lock().log_streams.insert(service.to_string(), rx);
        tx
    }

    async fn mapped_host_port(&self, handle: &ContainerHandle, _internal_port: u16) -> anyhow::Result<u16> {
        self.state
            .lock()
            .containers
            .get(handle.id())
            .map(|c| c.spec.host_port)
            .ok_or_else(|| anyhow::anyhow!("No such container: {}", handle))
    }

    async fn expose_host_ports(&self, ports: &[u16]) -> anyhow::Result<()> {
        self.state.lock().exposed_ports.extend(ports.iter().copied());
        Ok(())
    }
}

async fn serve_backend(listener: TcpListener, service: String, container_id: String, state: Arc<Mutex<FakeState>>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };

        {
            let mut guard = state.lock();
            let fake = &mut *guard;
            if let Some(remaining) = fake.closing.get_mut(&service).filter(|n| **n > 0) {
                *remaining -= 1;
                *fake.closed_connections.entry(service.clone()).or_default() += 1;
                drop(stream);
                continue;
            }
        }

        let service = service.clone();
        let container_id = container_id.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let handler = service_fn(move |req: Request<Incoming>| {
                *state.lock().requests.entry(service.clone()).or_default() += 1;
                let service = service.clone();
                let container_id = container_id.clone();
                async move {
                    let (status, content_type, body, delay) =
                        backend_reply(req, &service, &container_id).await;
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    Response::builder()
                        .status(status)
                        .header("content-type", content_type)
                        .header("x-fake-container", container_id)
                        .body(Full::new(Bytes::from(body)))
                }
            });
            let _ = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), handler)
                .await;
        });
    }
}

type Reply = (StatusCode, &'static str, String, Option<Duration>);

async fn backend_reply(req: Request<Incoming>, service: &str, container_id: &str) -> Reply {
    let path = req.uri().path().to_string();
    match path.as_str() {
        "/inspect" => {
            let method = req.method().to_string();
            let query = req.uri().query().unwrap_or_default().to_string();
            let body = match req.into_body().collect().await {
                Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
                Err(_) => String::new(),
            };
            let json = serde_json::json!({
                "method": method,
                "path": path,
                "query": query,
                "body": body,
            });
            (StatusCode::OK, "application/json", json.to_string(), None)
        }
        "/echo" => (StatusCode::OK, "text/plain", "echo response".to_string(), None),
        "/headers" => {
            let headers: BTreeMap<String, String> = req
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = serde_json::to_string(&headers).unwrap_or_default();
            (StatusCode::OK, "application/json", body, None)
        }
        "/slow" => (
            StatusCode::OK,
            "text/plain",
            "slow response".to_string(),
            Some(Duration::from_secs(2)),
        ),
        "/error" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            "error".to_string(),
            None,
        ),
        _ => (
            StatusCode::OK,
            "text/plain",
            format!("Hello from {} ({})", service, container_id),
            None,
        ),
    }
}
