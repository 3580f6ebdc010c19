use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Lifecycle timings and environment injection settings
    #[serde(default)]
    pub defaults: LifecycleDefaults,

    /// Discovery registration and the endpoint injected into containers
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Declared backend services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Static redirects that bypass container management
    #[serde(default)]
    pub overwrites: Vec<OverwriteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the per-service listeners (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Host announced to discovery for each listener
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Hostname under which containers reach the proxy host
    #[serde(default = "default_container_host_alias")]
    pub container_host_alias: String,

    /// Port for the liveness/status endpoint
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// First port tried for service listeners
    #[serde(default = "default_listener_port_start")]
    pub listener_port_start: u16,

    /// Last port tried for service listeners
    #[serde(default = "default_listener_port_end")]
    pub listener_port_end: u16,

    /// First host port tried for container port mappings
    #[serde(default = "default_container_port_start")]
    pub container_port_start: u16,

    /// Last host port tried for container port mappings
    #[serde(default = "default_container_port_end")]
    pub container_port_end: u16,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Compose file started before the listeners and stopped after them
    pub compose_file: Option<PathBuf>,

    /// Docker host URL (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            advertise_host: default_advertise_host(),
            container_host_alias: default_container_host_alias(),
            admin_port: default_admin_port(),
            listener_port_start: default_listener_port_start(),
            listener_port_end: default_listener_port_end(),
            container_port_start: default_container_port_start(),
            container_port_end: default_container_port_end(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            compose_file: None,
            docker_host: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleDefaults {
    /// Idle time in seconds after which a running container is stopped
    #[serde(default = "default_standby")]
    pub standby_secs: u64,

    /// Period of the idle sweep in seconds
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Maximum time in seconds to wait for a container to become ready
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Maximum time in seconds to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period in seconds given to a container on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Environment variable carrying the merged JSON configuration
    #[serde(default = "default_json_env_var")]
    pub json_env_var: String,

    /// Environment variable carrying the service profile
    #[serde(default = "default_profile_env_var")]
    pub profile_env_var: String,
}

impl Default for LifecycleDefaults {
    fn default() -> Self {
        Self {
            standby_secs: default_standby(),
            reap_interval_secs: default_reap_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            request_timeout_secs: default_request_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            json_env_var: default_json_env_var(),
            profile_env_var: default_profile_env_var(),
        }
    }
}

impl LifecycleDefaults {
    pub fn standby(&self) -> Duration {
        Duration::from_secs(self.standby_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// URL that receives a JSON registration per service listener.
    /// Registrations are only logged when unset.
    pub register_url: Option<String>,

    /// Discovery endpoint injected into every container's JSON configuration
    #[serde(default = "default_discovery_endpoint")]
    pub endpoint: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            register_url: None,
            endpoint: default_discovery_endpoint(),
        }
    }
}

/// Configuration for a single backend service
///
/// # Security Warning
///
/// Container images are pulled and run, and build contexts are built, with
/// the privileges of the Docker daemon. Configuration files must be protected
/// with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    /// Unique service name, also the key used for discovery
    #[serde(default)]
    pub name: String,

    /// Registry image reference (exclusive with `build_context`)
    pub image: Option<String>,

    /// Directory, or path to a Dockerfile, to build the image from
    #[serde(alias = "dockerfile")]
    pub build_context: Option<PathBuf>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Runtime profile handed to the container
    pub profile: Option<String>,

    /// Port the service listens on inside the container
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Regex matched against container log lines to detect readiness
    #[serde(alias = "wait_for_regex")]
    pub readiness_pattern: Option<String>,
}

impl ServiceConfig {
    /// Create a service config backed by a registry image
    pub fn image(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: Some(image.to_string()),
            internal_port: default_internal_port(),
            ..Default::default()
        }
    }

    /// Create a service config built from a local context
    pub fn build_context(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            build_context: Some(path.into()),
            internal_port: default_internal_port(),
            ..Default::default()
        }
    }

    /// Set the internal port (builder pattern)
    pub fn with_internal_port(mut self, port: u16) -> Self {
        self.internal_port = port;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the readiness pattern (builder pattern)
    pub fn with_readiness_pattern(mut self, pattern: &str) -> Self {
        self.readiness_pattern = Some(pattern.to_string());
        self
    }

    /// Set the profile (builder pattern)
    pub fn with_profile(mut self, profile: &str) -> Self {
        self.profile = Some(profile.to_string());
        self
    }
}

/// Static redirect for a declared service
#[derive(Debug, Deserialize, Clone)]
pub struct OverwriteConfig {
    pub name: String,

    #[serde(default = "default_overwrite_host")]
    pub host: String,

    #[serde(default = "default_overwrite_port")]
    pub port: u16,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_container_host_alias() -> String {
    "host.docker.internal".to_string()
}

fn default_admin_port() -> u16 {
    8761
}

fn default_listener_port_start() -> u16 {
    9000
}

fn default_listener_port_end() -> u16 {
    9999
}

fn default_container_port_start() -> u16 {
    20000
}

fn default_container_port_end() -> u16 {
    29999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_standby() -> u64 {
    300 // 5 minutes
}

fn default_reap_interval() -> u64 {
    60
}

fn default_readiness_timeout() -> u64 {
    120 // image pulls and JVM startups are slow
}

fn default_request_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_json_env_var() -> String {
    "SPRING_APPLICATION_JSON".to_string()
}

fn default_profile_env_var() -> String {
    "SPRING_PROFILES_ACTIVE".to_string()
}

fn default_discovery_endpoint() -> String {
    "http://host.docker.internal:8761/eureka".to_string()
}

fn default_internal_port() -> u16 {
    8080
}

fn default_overwrite_host() -> String {
    "127.0.0.1".to_string()
}

fn default_overwrite_port() -> u16 {
    8080
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate server-level settings. Service definitions are validated
    /// when the catalog is built from this config.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.listener_port_start == 0
            || self.server.listener_port_start > self.server.listener_port_end
        {
            errors.push(format!(
                "listener port range {}..={} is empty",
                self.server.listener_port_start, self.server.listener_port_end
            ));
        }
        if self.server.container_port_start == 0
            || self.server.container_port_start > self.server.container_port_end
        {
            errors.push(format!(
                "container port range {}..={} is empty",
                self.server.container_port_start, self.server.container_port_end
            ));
        }
        if self.defaults.reap_interval_secs == 0 {
            errors.push("'reap_interval_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
