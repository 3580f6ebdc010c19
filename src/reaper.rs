//! Periodic idle sweep

use crate::lifecycle::ContainerLifecycleManager;
use crate::registry::InstanceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stops services whose last access is older than the standby threshold
pub struct IdleReaper {
    registry: Arc<InstanceRegistry>,
    lifecycle: Arc<ContainerLifecycleManager>,
    period: Duration,
    standby: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        lifecycle: Arc<ContainerLifecycleManager>,
        period: Duration,
        standby: Duration,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            period,
            standby,
        }
    }

    /// Run one sweep now and return the services that were stopped
    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<String> = self
            .registry
            .cached()
            .into_iter()
            .filter(|(_, last_access)| match last_access {
                Some(last) => now.saturating_duration_since(*last) > self.standby,
                None => true,
            })
            .map(|(name, _)| name)
            .collect();

        let mut stopped = Vec::new();
        for name in candidates {
            let guard = match self.registry.lock(&name).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(service = %name, error = %e, "Cannot lock service for idle check");
                    continue;
                }
            };

            // A request may have landed while we waited for the lock
            if !guard.is_idle(self.standby, now) {
                debug!(service = %name, "Service became active, keeping it");
                continue;
            }

            info!(
                service = %name,
                standby_secs = self.standby.as_secs(),
                "Idle timeout reached, stopping service"
            );

            // Uncached while stopping: new requests wait on the lock and cold start
            let address = guard.take_address();
            match self.lifecycle.stop(&name).await {
                Ok(()) => {
                    debug!(service = %name, address = ?address, "Idle service stopped");
                    stopped.push(name);
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "Failed to stop idle service");
                    if let Some(address) = address {
                        guard.restore_address(address);
                    }
                }
            }
        }
        stopped
    }

    /// Sweep every `period` until shutdown is signalled
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    let stopped = self.sweep().await;
                    if !stopped.is_empty() {
                        info!(services = ?stopped, "Idle sweep stopped services");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Idle reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceCatalog;
    use crate::config::{Config, ServiceConfig};
    use crate::lifecycle::LifecycleSettings;
    use crate::ports::PortAllocator;
    use crate::testing::FakeRuntime;
    use tokio::net::TcpStream;

    const STANDBY: Duration = Duration::from_secs(300);

    struct Harness {
        runtime: Arc<FakeRuntime>,
        registry: Arc<InstanceRegistry>,
        reaper: IdleReaper,
    }

    fn harness(names: &[&str]) -> Harness {
        let config = Config {
            services: names
                .iter()
                .map(|n| ServiceConfig::image(n, "nginx").with_readiness_pattern("ready"))
                .collect(),
            ..Default::default()
        };
        let runtime = Arc::new(FakeRuntime::new());
        let catalog = Arc::new(ServiceCatalog::from_config(&config).unwrap());
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            runtime.clone(),
            Arc::new(PortAllocator::new(43999)),
            LifecycleSettings {
                readiness_timeout: Duration::from_secs(5),
                stop_timeout: Duration::from_secs(1),
                container_port_start: 43000,
                json_env_var: "SPRING_APPLICATION_JSON".to_string(),
                profile_env_var: "SPRING_PROFILES_ACTIVE".to_string(),
                discovery_endpoint: "http://127.0.0.1:8761/eureka".to_string(),
                container_host_alias: "host.docker.internal".to_string(),
            },
        ));
        let registry = Arc::new(InstanceRegistry::new(catalog, Arc::clone(&lifecycle)));
        let reaper = IdleReaper::new(
            Arc::clone(&registry),
            lifecycle,
            Duration::from_millis(50),
            STANDBY,
        );
        Harness {
            runtime,
            registry,
            reaper,
        }
    }

    #[tokio::test]
    async fn test_recently_used_service_is_kept() {
        let h = harness(&["echo"]);
        h.registry.resolve("echo").await.unwrap();

        let stopped = h.reaper.sweep_at(Instant::now() + Duration::from_secs(10)).await;
        assert!(stopped.is_empty());
        assert!(h.registry.address("echo").is_some());
        assert_eq!(h.runtime.stop_count("echo"), 0);
    }

    #[tokio::test]
    async fn test_idle_service_is_stopped() {
        let h = harness(&["echo"]);
        h.registry.resolve("echo").await.unwrap();

        let later = Instant::now() + STANDBY + Duration::from_secs(1);
        let stopped = h.reaper.sweep_at(later).await;
        assert_eq!(stopped, vec!["echo".to_string()]);
        assert_eq!(h.registry.address("echo"), None);
        assert_eq!(h.runtime.stop_count("echo"), 1);

        // Next request cold starts again
        h.registry.resolve("echo").await.unwrap();
        assert_eq!(h.runtime.start_count("echo"), 2);
    }

    #[tokio::test]
    async fn test_exactly_standby_is_not_idle() {
        let h = harness(&["echo"]);
        h.registry.resolve("echo").await.unwrap();
        let last = h.registry.last_access("echo").unwrap();

        assert!(h.reaper.sweep_at(last + STANDBY).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_halt_sweep() {
        let h = harness(&["a", "b"]);
        h.registry.resolve("a").await.unwrap();
        h.registry.resolve("b").await.unwrap();
        h.runtime.fail_stop("a");

        let later = Instant::now() + STANDBY + Duration::from_secs(1);
        let stopped = h.reaper.sweep_at(later).await;

        assert_eq!(stopped, vec!["b".to_string()]);
        assert!(h.registry.address("a").is_some());
        assert_eq!(h.registry.address("b"), None);
    }

    #[tokio::test]
    async fn test_resolve_during_stop_gets_a_fresh_instance() {
        let h = harness(&["echo"]);
        h.runtime.set_stop_delay(Duration::from_millis(300));
        h.registry.resolve("echo").await.unwrap();

        let reaper = Arc::new(h.reaper);
        let sweep = {
            let reaper = Arc::clone(&reaper);
            let later = Instant::now() + STANDBY + Duration::from_secs(1);
            tokio::spawn(async move { reaper.sweep_at(later).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.registry.address("echo"), None);

        // Blocks until the stop finishes, then cold starts
        let address = h.registry.resolve("echo").await.unwrap();
        assert_eq!(sweep.await.unwrap(), vec!["echo".to_string()]);
        assert_eq!(h.runtime.start_count("echo"), 2);
        assert_eq!(h.runtime.live_containers(), 1);
        assert_eq!(h.registry.address("echo"), Some(address.clone()));
        assert!(TcpStream::connect((address.host.as_str(), address.port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let h = harness(&["echo"]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = Arc::new(h.reaper);

        let task = {
            let reaper = Arc::clone(&reaper);
            tokio::spawn(async move { reaper.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reaper should stop")
            .unwrap();
    }
}
