//! Docker implementation of [`ContainerRuntime`]

use crate::relay::TcpRelay;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::InspectNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Host interface container ports are published on
const PUBLISH_HOST: &str = "127.0.0.1";

/// Where relayed host ports are forwarded to
const RELAY_TARGET_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Runs service containers through the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
    /// Hostname containers use to reach the proxy host
    host_alias: String,
    /// Host ports exposed so far, with the relay serving each one. `None`
    /// when the port needs no relay or none could be bound.
    relays: Mutex<HashMap<u16, Option<TcpRelay>>>,
    /// Gateway address of the default bridge network, looked up once
    bridge_gateway: OnceCell<Option<IpAddr>>,
    docker_path: String,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>, host_alias: &str) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            host_alias: host_alias.to_string(),
            relays: Mutex::new(HashMap::new()),
            bridge_gateway: OnceCell::new(),
            docker_path: "docker".to_string(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if !Path::new(path).exists() {
                continue;
            }
            debug!(path, "Found Docker socket");
            if let Ok(client) =
                Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start Docker, set DOCKER_HOST, or configure server.docker_host.",
                e
            )
        })
    }

    /// Pull an image unless it is already present locally
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        anyhow::bail!("Failed to pull image '{}': {}", image, error);
                    }
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                }
                Err(e) => anyhow::bail!("Failed to pull image '{}': {}", image, e),
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn remove(&self, container: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(container, Some(options)).await {
            Ok(_) => {
                debug!(container, "Removed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Failed to remove container '{}': {}", container, e)),
        }
    }
}

fn container_name(service: &str) -> String {
    let sanitized: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("zerogate-{}", sanitized)
}

/// Split a log frame into its stream name and text
fn decode_output(output: &LogOutput) -> Option<(&'static str, String)> {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => ("stdout", message),
        LogOutput::StdErr { message } => ("stderr", message),
        LogOutput::Console { message } => ("console", message),
        LogOutput::StdIn { .. } => return None,
    };
    Some((stream, String::from_utf8_lossy(message).into_owned()))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn host(&self) -> &str {
        PUBLISH_HOST
    }

    async fn build(&self, context: &Path, tag: &str) -> anyhow::Result<String> {
        info!(context = %context.display(), image = tag, "Building image");

        let output = Command::new(&self.docker_path)
            .arg("build")
            .arg("-t")
            .arg(tag)
            .arg(context)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to spawn docker build: {}", e))?;

        for line in String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
        {
            debug!(target: "docker", "{}", line);
        }

        if !output.status.success() {
            anyhow::bail!(
                "docker build of '{}' failed with exit code {}",
                context.display(),
                output.status.code().unwrap_or(-1)
            );
        }

        info!(image = tag, "Image built");
        Ok(tag.to_string())
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let name = container_name(&spec.service);
        // Leftover from a previous run of this process
        let _ = self.remove(&name).await;

        let port_key = format!("{}/tcp", spec.internal_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some(PUBLISH_HOST.to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            extra_hosts: Some(vec![format!("{}:host-gateway", self.host_alias)]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env_list()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    name, spec.image, e
                )
            })?;

        info!(
            service = %spec.service,
            container_id = %response.id,
            container_name = %name,
            image = %spec.image,
            "Created Docker container"
        );
        Ok(ContainerHandle(response.id))
    }

    async fn start(&self, handle: &ContainerHandle) -> anyhow::Result<()> {
        self.client
            .start_container(handle.id(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start container {}: {}", handle, e))?;
        info!(container_id = %handle, "Started Docker container");
        Ok(())
    }

    async fn wait_for_log(&self, handle: &ContainerHandle, pattern: &Regex) -> anyhow::Result<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut logs = self.client.logs(handle.id(), Some(options));
        while let Some(frame) = logs.next().await {
            let frame =
                frame.map_err(|e| anyhow::anyhow!("Error reading logs of {}: {}", handle, e))?;
            if let Some((_, text)) = decode_output(&frame) {
                if text.lines().any(|line| pattern.is_match(line)) {
                    debug!(container_id = %handle, pattern = %pattern, "Readiness log line seen");
                    return Ok(());
                }
            }
        }

        anyhow::bail!(
            "container {} exited before logging a line matching '{}'",
            handle,
            pattern
        )
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(handle.id(), Some(options)).await {
            Ok(_) => info!(container_id = %handle, "Stopped Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id = %handle, "Container was already stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %handle, "Container not found");
                return Ok(());
            }
            Err(e) => {
                warn!(container_id = %handle, error = %e, "Error stopping container, forcing removal");
            }
        }

        self.remove(handle.id()).await
    }

    fn stream_logs(&self, handle: &ContainerHandle, service: &str) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = self.client.clone();
        let container_id = handle.id().to_string();
        let service = service.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: false,
                ..Default::default()
            };

            let mut log_stream = client.logs(&container_id, Some(options));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(service, container_id, "Log streaming stopped");
                        break;
                    }
                    log_result = log_stream.next() => {
                        match log_result {
                            Some(Ok(output)) => {
                                if let Some((stream, text)) = decode_output(&output) {
                                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                                        debug!(target: "container", service, stream, "{}", line);
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(service, container_id, error = %e, "Error reading container logs");
                                break;
                            }
                            None => {
                                debug!(service, container_id, "Container log stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    async fn mapped_host_port(
        &self,
        handle: &ContainerHandle,
        internal_port: u16,
    ) -> anyhow::Result<u16> {
        let info = self
            .client
            .inspect_container(handle.id(), None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", handle, e))?;

        let key = format!("{}/tcp", internal_port);
        info.network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            })
            .ok_or_else(|| anyhow::anyhow!("Container {} has no host mapping for {}", handle, key))
    }

    /// Make loopback-bound host ports reachable from containers through
    /// `<alias>:host-gateway`, relaying each one from the bridge gateway
    async fn expose_host_ports(&self, ports: &[u16]) -> anyhow::Result<()> {
        let mut relays = self.relays.lock().await;
        let pending: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|p| !relays.contains_key(p))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let gateway = self.bridge_gateway().await;
        for port in pending {
            let relay = match gateway {
                Some(ip) => self.relay_port(ip, port).await,
                None => None,
            };
            relays.insert(port, relay);
        }
        Ok(())
    }
}

impl DockerRuntime {
    async fn bridge_gateway(&self) -> Option<IpAddr> {
        *self
            .bridge_gateway
            .get_or_init(|| async {
                let network = match self
                    .client
                    .inspect_network("bridge", None::<InspectNetworkOptions<String>>)
                    .await
                {
                    Ok(network) => network,
                    Err(e) => {
                        warn!(error = %e, "Failed to inspect the bridge network, host ports are not relayed");
                        return None;
                    }
                };
                let gateway = network
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| {
                        configs
                            .into_iter()
                            .find_map(|c| c.gateway.and_then(|g| g.parse::<IpAddr>().ok()))
                    });
                match gateway {
                    Some(ip) => debug!(gateway = %ip, "Bridge gateway found"),
                    None => warn!("Bridge network has no gateway address, host ports are not relayed"),
                }
                gateway
            })
            .await
    }

    async fn relay_port(&self, gateway: IpAddr, port: u16) -> Option<TcpRelay> {
        let listen = SocketAddr::new(gateway, port);
        match TcpRelay::bind(listen, SocketAddr::new(RELAY_TARGET_HOST, port)).await {
            Ok(relay) => {
                info!(alias = %self.host_alias, %listen, "Host port relayed to containers");
                Some(relay)
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                // Already bound on all interfaces
                debug!(%listen, "Host port reachable without a relay");
                None
            }
            Err(e) if e.kind() == ErrorKind::AddrNotAvailable => {
                debug!(%listen, "Bridge gateway is not a local address, daemon runs in a VM");
                None
            }
            Err(e) => {
                warn!(%listen, error = %e, "Cannot relay host port to containers");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_sanitized() {
        assert_eq!(container_name("echo"), "zerogate-echo");
        assert_eq!(container_name("api.v2/x"), "zerogate-api-v2-x");
    }

    #[test]
    fn test_decode_output() {
        let out = LogOutput::StdErr {
            message: "boom\n".into(),
        };
        assert_eq!(decode_output(&out), Some(("stderr", "boom\n".to_string())));
        let out = LogOutput::StdIn {
            message: "ignored".into(),
        };
        assert_eq!(decode_output(&out), None);
    }
}
