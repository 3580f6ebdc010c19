//! Assembles the proxy from configuration
//!
//! [`Gateway::bind`] validates the catalog before any socket is opened, then
//! binds the service listeners and the admin endpoint. [`Gateway::run`] serves
//! until shutdown and stops every container it started.

use crate::admin::{AdminServer, AdminState};
use crate::catalog::ServiceCatalog;
use crate::config::Config;
use crate::discovery::Discovery;
use crate::lifecycle::{ContainerLifecycleManager, LifecycleSettings};
use crate::ports::PortAllocator;
use crate::reaper::IdleReaper;
use crate::registry::InstanceRegistry;
use crate::router::{RequestRouter, RouterSettings};
use crate::runtime::SharedRuntime;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct Gateway {
    registry: Arc<InstanceRegistry>,
    lifecycle: Arc<ContainerLifecycleManager>,
    router: RequestRouter,
    admin: AdminServer,
    admin_addr: SocketAddr,
    reaper: Arc<IdleReaper>,
}

impl Gateway {
    pub async fn bind(
        config: &Config,
        runtime: SharedRuntime,
        discovery: &dyn Discovery,
    ) -> anyhow::Result<Self> {
        let catalog = Arc::new(ServiceCatalog::from_config(config)?);
        let settings = RouterSettings::from_config(config)?;
        if catalog.is_empty() {
            warn!("No services declared, only the admin endpoint will listen");
        } else {
            info!(services = catalog.len(), "Service catalog loaded");
        }

        let container_ports = Arc::new(PortAllocator::new(config.server.container_port_end));
        let listener_ports = PortAllocator::new(config.server.listener_port_end);

        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            runtime,
            container_ports,
            LifecycleSettings::from_defaults(
                &config.defaults,
                config.server.container_port_start,
                &config.discovery.endpoint,
                &config.server.container_host_alias,
            ),
        ));
        let registry = Arc::new(InstanceRegistry::new(catalog, Arc::clone(&lifecycle)));

        let bind_ip = settings.bind;
        let router = RequestRouter::bind(Arc::clone(&registry), &listener_ports, settings, discovery).await?;

        let admin_state = AdminState {
            registry: Arc::clone(&registry),
            listener_ports: Arc::new(router.listener_ports().clone()),
            pool_stats: router.pool().stats(),
        };
        let admin = AdminServer::bind(SocketAddr::new(bind_ip, config.server.admin_port), admin_state).await?;
        let admin_addr = admin.local_addr()?;

        lifecycle.advertise_host_port(admin_addr.port());
        for port in router.listener_ports().values() {
            lifecycle.advertise_host_port(*port);
        }

        let reaper = Arc::new(IdleReaper::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            config.defaults.reap_interval(),
            config.defaults.standby(),
        ));

        Ok(Self {
            registry,
            lifecycle,
            router,
            admin,
            admin_addr,
            reaper,
        })
    }

    pub fn listener_port(&self, service: &str) -> Option<u16> {
        self.router.listener_port(service)
    }

    pub fn listener_ports(&self) -> &BTreeMap<String, u16> {
        self.router.listener_ports()
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin_addr
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    /// Serve until `shutdown_rx` flips to `true`, then stop all containers
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let reaper = Arc::clone(&self.reaper);
        let reaper_shutdown = shutdown_rx.clone();
        let reaper_handle = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

        let admin_shutdown = shutdown_rx.clone();
        let admin = self.admin;
        let admin_handle = tokio::spawn(async move {
            if let Err(e) = admin.run(admin_shutdown).await {
                error!(error = %e, "Admin server error");
            }
        });

        self.router.run(shutdown_rx).await;

        let _ = reaper_handle.await;
        let _ = admin_handle.await;

        info!("Stopping all services...");
        self.lifecycle.stop_all().await;
    }
}
