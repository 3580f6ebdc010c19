//! Starting and stopping service containers
//!
//! [`ContainerLifecycleManager`] is the only owner of runtime handles. A
//! failed start tears down whatever it created before returning, so a failed
//! attempt never leaks a container or a port reservation.

use crate::catalog::{Address, LaunchSource, ServiceDefinition};
use crate::config::LifecycleDefaults;
use crate::error::{Error, Result};
use crate::merge::merge_json_str;
use crate::ports::PortAllocator;
use crate::runtime::{ContainerHandle, ContainerSpec, SharedRuntime};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Interval between TCP probes when no readiness pattern is configured
const PORT_PROBE_INTERVAL_MS: u64 = 200;

/// How long a probe connection must stay open, silent, before the port
/// counts as served
const PORT_PROBE_HOLD_MS: u64 = 250;

/// A started, ready backend
#[derive(Debug, Clone)]
pub struct RunningInstance {
    pub service: String,
    pub address: Address,
}

/// Settings the lifecycle manager needs from configuration
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub readiness_timeout: Duration,
    pub stop_timeout: Duration,
    pub container_port_start: u16,
    pub json_env_var: String,
    pub profile_env_var: String,
    /// Discovery endpoint injected into each container
    pub discovery_endpoint: String,
    /// Hostname containers use to reach this host
    pub container_host_alias: String,
}

impl LifecycleSettings {
    pub fn from_defaults(
        defaults: &LifecycleDefaults,
        container_port_start: u16,
        discovery_endpoint: &str,
        container_host_alias: &str,
    ) -> Self {
        Self {
            readiness_timeout: defaults.readiness_timeout(),
            stop_timeout: defaults.stop_timeout(),
            container_port_start,
            json_env_var: defaults.json_env_var.clone(),
            profile_env_var: defaults.profile_env_var.clone(),
            discovery_endpoint: discovery_endpoint.to_string(),
            container_host_alias: container_host_alias.to_string(),
        }
    }
}

/// Runtime resources held for a running container
struct TrackedContainer {
    handle: ContainerHandle,
    host_port: u16,
    log_shutdown: watch::Sender<bool>,
}

pub struct ContainerLifecycleManager {
    runtime: SharedRuntime,
    ports: Arc<PortAllocator>,
    settings: LifecycleSettings,
    containers: DashMap<String, TrackedContainer>,
    /// Host ports containers must be able to reach
    advertised_ports: RwLock<BTreeSet<u16>>,
}

impl ContainerLifecycleManager {
    pub fn new(runtime: SharedRuntime, ports: Arc<PortAllocator>, settings: LifecycleSettings) -> Self {
        Self {
            runtime,
            ports,
            settings,
            containers: DashMap::new(),
            advertised_ports: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register a host port that started containers need to reach
    pub fn advertise_host_port(&self, port: u16) {
        self.advertised_ports.write().insert(port);
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.containers.contains_key(service)
    }

    /// Names of services with a tracked container
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Launch a container for `definition` and wait until it is ready
    pub async fn start(&self, definition: &ServiceDefinition) -> Result<RunningInstance> {
        let service = definition.name.as_str();

        if self.containers.contains_key(service) {
            warn!(service, "Stale container tracked for service, stopping it first");
            self.stop(service).await?;
        }

        let image = match &definition.source {
            LaunchSource::Image(image) => image.clone(),
            LaunchSource::BuildContext(context) => {
                let tag = format!("zerogate-{}:latest", service.to_lowercase());
                self.runtime
                    .build(context, &tag)
                    .await
                    .map_err(|e| Error::start_failed(service, format!("image build failed: {}", e)))?
            }
        };

        let env = compose_env(definition, &self.settings)?;

        let host_port = self
            .ports
            .allocate(self.settings.container_port_start)
            .map_err(|e| Error::start_failed(service, e))?;

        let spec = ContainerSpec {
            service: service.to_string(),
            image,
            internal_port: definition.internal_port,
            host_port,
            env,
        };

        info!(service, image = %spec.image, host_port, "Starting container");

        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.ports.release(host_port);
                return Err(Error::start_failed(service, e));
            }
        };

        match self.launch(definition, &handle).await {
            Ok(address) => {
                let log_shutdown = self.runtime.stream_logs(&handle, service);
                self.containers.insert(
                    service.to_string(),
                    TrackedContainer {
                        handle,
                        host_port,
                        log_shutdown,
                    },
                );
                info!(service, %address, "Service is ready");
                Ok(RunningInstance {
                    service: service.to_string(),
                    address,
                })
            }
            Err(e) => {
                error!(service, error = %e, "Start failed, removing container");
                if let Err(stop_err) = self.runtime.stop(&handle, self.settings.stop_timeout).await {
                    warn!(service, error = %stop_err, "Failed to remove container after failed start");
                }
                self.ports.release(host_port);
                Err(e)
            }
        }
    }

    /// Start the created container, wait for readiness and resolve its address
    async fn launch(&self, definition: &ServiceDefinition, handle: &ContainerHandle) -> Result<Address> {
        let service = definition.name.as_str();

        let exposed: Vec<u16> = self.advertised_ports.read().iter().copied().collect();
        self.runtime
            .expose_host_ports(&exposed)
            .await
            .map_err(|e| Error::start_failed(service, e))?;

        self.runtime
            .start(handle)
            .await
            .map_err(|e| Error::start_failed(service, e))?;

        let timeout = self.settings.readiness_timeout;
        let ready = async {
            let port = match &definition.readiness_pattern {
                Some(pattern) => {
                    debug!(service, pattern = %pattern, "Waiting for readiness log line");
                    self.runtime
                        .wait_for_log(handle, pattern)
                        .await
                        .map_err(|e| Error::start_failed(service, e))?;
                    self.mapped_port(service, handle, definition.internal_port).await?
                }
                None => {
                    let port = self.mapped_port(service, handle, definition.internal_port).await?;
                    debug!(service, port, "Waiting for port to be served");
                    self.wait_for_port(port).await;
                    port
                }
            };
            Ok::<_, Error>(port)
        };

        let port = tokio::time::timeout(timeout, ready)
            .await
            .map_err(|_| Error::ReadinessTimeout {
                service: service.to_string(),
                timeout,
            })??;

        Ok(Address::new(self.runtime.host(), port))
    }

    async fn mapped_port(&self, service: &str, handle: &ContainerHandle, internal_port: u16) -> Result<u16> {
        self.runtime
            .mapped_host_port(handle, internal_port)
            .await
            .map_err(|e| Error::start_failed(service, e))
    }

    async fn wait_for_port(&self, port: u16) {
        let host = self.runtime.host().to_string();
        while !probe_port(&host, port).await {
            tokio::time::sleep(Duration::from_millis(PORT_PROBE_INTERVAL_MS)).await;
        }
    }

    /// Stop the container tracked for `service`. Untracked services are a no-op.
    pub async fn stop(&self, service: &str) -> Result<()> {
        let Some((_, tracked)) = self.containers.remove(service) else {
            debug!(service, "Stop requested but no container is tracked");
            return Ok(());
        };

        info!(service, container_id = %tracked.handle, "Stopping container");
        match self
            .runtime
            .stop(&tracked.handle, self.settings.stop_timeout)
            .await
        {
            Ok(()) => {
                let _ = tracked.log_shutdown.send(true);
                self.ports.release(tracked.host_port);
                Ok(())
            }
            Err(e) => {
                // Still running: keep tracking it and its log stream so a later stop can retry
                let reason = e.to_string();
                self.containers.insert(service.to_string(), tracked);
                Err(Error::StopFailed {
                    service: service.to_string(),
                    reason,
                })
            }
        }
    }

    /// Stop every tracked container
    pub async fn stop_all(&self) {
        for service in self.running() {
            if let Err(e) = self.stop(&service).await {
                warn!(service, error = %e, "Failed to stop container during shutdown");
            }
        }
    }
}

/// Whether something is actually serving `host:port`.
///
/// A published port can accept connections before the app behind it listens;
/// the forwarder then closes them at once. The port counts as served when the
/// peer sends data or keeps the connection open for the hold period.
pub async fn probe_port(host: &str, port: u16) -> bool {
    let Ok(mut stream) = TcpStream::connect((host, port)).await else {
        return false;
    };
    let mut buf = [0u8; 1];
    match tokio::time::timeout(
        Duration::from_millis(PORT_PROBE_HOLD_MS),
        stream.read(&mut buf),
    )
    .await
    {
        Ok(Ok(n)) => n > 0,
        Ok(Err(_)) => false,
        Err(_) => true,
    }
}

/// Build a container's environment from its declared env plus the
/// infrastructure keys
pub fn compose_env(
    definition: &ServiceDefinition,
    settings: &LifecycleSettings,
) -> Result<HashMap<String, String>> {
    let mut env = definition.env.clone();

    let infra = serde_json::json!({
        "eureka": {
            "client": {
                "serviceUrl": { "defaultZone": settings.discovery_endpoint }
            },
            "instance": { "hostname": settings.container_host_alias }
        },
        "server": { "port": definition.internal_port }
    });

    let declared = env.get(&settings.json_env_var).map(String::as_str).unwrap_or("{}");
    let merged = merge_json_str(declared, &infra.to_string()).map_err(|e| {
        Error::start_failed(
            &definition.name,
            format!("{} is not valid JSON: {}", settings.json_env_var, e),
        )
    })?;

    env.insert(settings.json_env_var.clone(), merged);
    env.insert(
        settings.profile_env_var.clone(),
        definition.profile.clone().unwrap_or_default(),
    );
    Ok(env)
}
