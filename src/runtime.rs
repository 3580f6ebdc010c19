//! Boundary to the container runtime
//!
//! The lifecycle manager only talks to containers through this trait. The
//! Docker implementation lives in [`crate::docker`]; tests use
//! [`crate::testing::FakeRuntime`].

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Opaque reference to a created container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create one service container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Service the container belongs to
    pub service: String,
    /// Image reference to run
    pub image: String,
    /// Port the service listens on inside the container
    pub internal_port: u16,
    /// Host port the internal port is published on
    pub host_port: u16,
    /// Environment variables
    pub env: HashMap<String, String>,
}

impl ContainerSpec {
    /// Environment in `KEY=value` form, sorted by key
    pub fn env_list(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        env
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host on which published container ports are reachable
    fn host(&self) -> &str;

    /// Build an image from a local context and return its reference
    async fn build(&self, context: &Path, tag: &str) -> anyhow::Result<String>;

    /// Create (but do not start) a container
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> anyhow::Result<()>;

    /// Resolve once a log line matches `pattern`. Callers bound the wait.
    async fn wait_for_log(&self, handle: &ContainerHandle, pattern: &Regex) -> anyhow::Result<()>;

    /// Stop and remove the container. Already gone is not an error.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> anyhow::Result<()>;

    /// Forward container output to the log. Sending `true` (or dropping the
    /// sender) ends the stream.
    fn stream_logs(&self, handle: &ContainerHandle, service: &str) -> watch::Sender<bool>;

    /// Host-side port the runtime published `internal_port` on
    async fn mapped_host_port(
        &self,
        handle: &ContainerHandle,
        internal_port: u16,
    ) -> anyhow::Result<u16>;

    /// Make host ports reachable from inside containers
    async fn expose_host_ports(&self, ports: &[u16]) -> anyhow::Result<()>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list_sorted() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1=1".to_string());
        let spec = ContainerSpec {
            service: "svc".into(),
            image: "img".into(),
            internal_port: 80,
            host_port: 20000,
            env,
        };
        assert_eq!(spec.env_list(), vec!["A=1=1".to_string(), "B=2".to_string()]);
    }
}
