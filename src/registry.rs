//! Get-or-start cache of live service addresses
//!
//! Each declared service owns one [`ServiceSlot`], created up front and never
//! removed. The slot's async mutex serialises starting and stopping that
//! service; its synchronous state keeps the cached address and last access
//! together so the reaper never sees one without the other.

use crate::catalog::{Address, ServiceCatalog};
use crate::error::{Error, Result};
use crate::lifecycle::ContainerLifecycleManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SlotState {
    address: Option<Address>,
    last_access: Option<Instant>,
}

impl SlotState {
    fn touch(&mut self, now: Instant) {
        self.last_access = Some(match self.last_access {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }
}

#[derive(Debug, Default)]
struct ServiceSlot {
    lock: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

pub struct InstanceRegistry {
    catalog: Arc<ServiceCatalog>,
    lifecycle: Arc<ContainerLifecycleManager>,
    slots: HashMap<String, ServiceSlot>,
}

impl InstanceRegistry {
    pub fn new(catalog: Arc<ServiceCatalog>, lifecycle: Arc<ContainerLifecycleManager>) -> Self {
        let slots = catalog
            .names()
            .map(|name| (name.to_string(), ServiceSlot::default()))
            .collect();
        Self {
            catalog,
            lifecycle,
            slots,
        }
    }

    pub fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    fn slot(&self, name: &str) -> Result<&ServiceSlot> {
        self.slots
            .get(name)
            .ok_or_else(|| Error::UnknownService(name.to_string()))
    }

    /// Return a live address for `name`, starting its container if needed.
    ///
    /// Concurrent callers for a cold service wait on the same start. A failed
    /// start leaves nothing cached, so the next call tries again.
    pub async fn resolve(&self, name: &str) -> Result<Address> {
        let definition = self.catalog.lookup(name)?;
        let slot = self.slot(name)?;

        {
            let mut state = slot.state.lock();
            state.touch(Instant::now());
            if let Some(address) = &definition.override_address {
                return Ok(address.clone());
            }
            if let Some(address) = &state.address {
                return Ok(address.clone());
            }
        }

        let _guard = slot.lock.lock().await;

        if let Some(address) = slot.state.lock().address.clone() {
            debug!(service = name, %address, "Service started by a concurrent request");
            return Ok(address);
        }

        info!(service = name, "Cold start");
        let instance = self.lifecycle.start(definition).await?;

        let mut state = slot.state.lock();
        state.address = Some(instance.address.clone());
        state.touch(Instant::now());
        Ok(instance.address)
    }

    /// Drop the cached address for `name`
    pub async fn mark_stopped(&self, name: &str) -> Result<()> {
        self.lock(name).await?.mark_stopped();
        Ok(())
    }

    /// Hold the per-service lock, blocking any resolve that needs to start
    pub async fn lock(&self, name: &str) -> Result<ServiceGuard<'_>> {
        let slot = self.slot(name)?;
        let guard = slot.lock.lock().await;
        Ok(ServiceGuard {
            name: name.to_string(),
            slot,
            _guard: guard,
        })
    }

    pub fn address(&self, name: &str) -> Option<Address> {
        self.slots.get(name)?.state.lock().address.clone()
    }

    pub fn last_access(&self, name: &str) -> Option<Instant> {
        self.slots.get(name)?.state.lock().last_access
    }

    /// Services with a cached address, with their last access
    pub fn cached(&self) -> Vec<(String, Option<Instant>)> {
        let mut cached: Vec<_> = self
            .slots
            .iter()
            .filter_map(|(name, slot)| {
                let state = slot.state.lock();
                state
                    .address
                    .as_ref()
                    .map(|_| (name.clone(), state.last_access))
            })
            .collect();
        cached.sort_by(|a, b| a.0.cmp(&b.0));
        cached
    }
}

/// Exclusive hold on one service's start/stop lock
pub struct ServiceGuard<'a> {
    name: String,
    slot: &'a ServiceSlot,
    _guard: MutexGuard<'a, ()>,
}

impl ServiceGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<Address> {
        self.slot.state.lock().address.clone()
    }

    /// Cached and unused for strictly longer than `threshold`
    pub fn is_idle(&self, threshold: Duration, now: Instant) -> bool {
        let state = self.slot.state.lock();
        match (&state.address, state.last_access) {
            (Some(_), Some(last)) => now.saturating_duration_since(last) > threshold,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Remove the cached address, sending new resolves to the locked slow path
    pub fn take_address(&self) -> Option<Address> {
        self.slot.state.lock().address.take()
    }

    /// Put back an address taken for a stop that did not happen
    pub fn restore_address(&self, address: Address) {
        self.slot.state.lock().address = Some(address);
    }

    pub fn mark_stopped(&self) {
        let mut state = self.slot.state.lock();
        if let Some(address) = state.address.take() {
            debug!(service = %self.name, %address, "Marked stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OverwriteConfig, ServiceConfig};
    use crate::lifecycle::LifecycleSettings;
    use crate::ports::PortAllocator;
    use crate::testing::FakeRuntime;

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            readiness_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(1),
            container_port_start: 42000,
            json_env_var: "SPRING_APPLICATION_JSON".to_string(),
            profile_env_var: "SPRING_PROFILES_ACTIVE".to_string(),
            discovery_endpoint: "http://127.0.0.1:8761/eureka".to_string(),
            container_host_alias: "host.docker.internal".to_string(),
        }
    }

    fn registry_for(config: &Config, runtime: Arc<FakeRuntime>) -> Arc<InstanceRegistry> {
        let catalog = Arc::new(ServiceCatalog::from_config(config).unwrap());
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            runtime,
            Arc::new(PortAllocator::new(42999)),
            settings(),
        ));
        Arc::new(InstanceRegistry::new(catalog, lifecycle))
    }

    fn echo_config() -> Config {
        Config {
            services: vec![ServiceConfig::image("echo", "nginx")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolve_starts_once() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_start_delay(Duration::from_millis(200));
        let registry = registry_for(&echo_config(), Arc::clone(&runtime));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.resolve("echo").await }));
        }

        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(runtime.start_count("echo"), 1);
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(registry.address("echo"), Some(addresses[0].clone()));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&echo_config(), runtime);
        assert!(matches!(
            registry.resolve("nope").await,
            Err(Error::UnknownService(name)) if name == "nope"
        ));
        assert!(registry.lock("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_last_access_is_monotonic() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&echo_config(), runtime);

        let mut previous = None;
        for _ in 0..5 {
            registry.resolve("echo").await.unwrap();
            let current = registry.last_access("echo");
            assert!(current.is_some());
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn test_touch_never_rewinds() {
        let mut state = SlotState::default();
        let later = Instant::now() + Duration::from_secs(10);
        state.touch(later);
        state.touch(Instant::now());
        assert_eq!(state.last_access, Some(later));
    }

    #[tokio::test]
    async fn test_override_never_starts_container() {
        let mut config = echo_config();
        config.overwrites.push(OverwriteConfig {
            name: "echo".to_string(),
            host: "10.0.0.7".to_string(),
            port: 8081,
        });
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&config, Arc::clone(&runtime));

        let address = registry.resolve("echo").await.unwrap();
        assert_eq!(address, Address::new("10.0.0.7", 8081));
        assert_eq!(runtime.create_count(), 0);
        assert!(registry.cached().is_empty());
        assert!(registry.last_access("echo").is_some());
    }

    #[tokio::test]
    async fn test_start_failure_is_not_cached() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_next_starts("echo", 1);
        let registry = registry_for(&echo_config(), Arc::clone(&runtime));

        assert!(matches!(
            registry.resolve("echo").await,
            Err(Error::StartFailed { .. })
        ));
        assert_eq!(registry.address("echo"), None);

        let address = registry.resolve("echo").await.unwrap();
        assert_eq!(registry.address("echo"), Some(address));
        assert_eq!(runtime.start_count("echo"), 2);
    }

    #[tokio::test]
    async fn test_mark_stopped_clears_cache() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&echo_config(), runtime);

        registry.resolve("echo").await.unwrap();
        assert_eq!(registry.cached().len(), 1);

        registry.mark_stopped("echo").await.unwrap();
        assert!(registry.cached().is_empty());
        assert_eq!(registry.address("echo"), None);
    }

    #[tokio::test]
    async fn test_guard_idle_check() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&echo_config(), runtime);

        {
            let guard = registry.lock("echo").await.unwrap();
            assert!(!guard.is_idle(Duration::ZERO, Instant::now()));
        }

        registry.resolve("echo").await.unwrap();
        let guard = registry.lock("echo").await.unwrap();
        let now = Instant::now();
        assert!(!guard.is_idle(Duration::from_secs(60), now));
        assert!(guard.is_idle(Duration::from_secs(60), now + Duration::from_secs(61)));
        assert_eq!(guard.name(), "echo");
        assert!(guard.address().is_some());
    }

    #[tokio::test]
    async fn test_taken_address_is_hidden_until_restored() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_for(&echo_config(), runtime);
        let address = registry.resolve("echo").await.unwrap();

        let guard = registry.lock("echo").await.unwrap();
        assert_eq!(guard.take_address(), Some(address.clone()));
        assert_eq!(registry.address("echo"), None);
        assert!(registry.cached().is_empty());

        guard.restore_address(address.clone());
        assert_eq!(registry.address("echo"), Some(address));
    }
}
