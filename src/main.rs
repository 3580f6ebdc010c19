use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zerogate::admin::{PKG_NAME, VERSION};
use zerogate::catalog::ServiceCatalog;
use zerogate::compose::ComposeStack;
use zerogate::config::Config;
use zerogate::discovery;
use zerogate::docker::DockerRuntime;
use zerogate::gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zerogate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("zerogate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    // Reject bad service definitions before touching Docker or binding anything
    ServiceCatalog::from_config(&config).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Invalid service definitions");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let runtime = Arc::new(
        DockerRuntime::connect(
            config.server.docker_host.as_deref(),
            &config.server.container_host_alias,
        )
        .await?,
    );

    let compose = config.server.compose_file.as_ref().map(ComposeStack::new);
    if let Some(stack) = &compose {
        stack.up().await?;
    }

    let discovery = discovery::from_config(&config.discovery)?;
    let gateway = match Gateway::bind(&config, runtime, discovery.as_ref()).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "Failed to start listeners");
            if let Some(stack) = &compose {
                if let Err(e) = stack.down().await {
                    warn!(error = %e, "Failed to stop compose services");
                }
            }
            return Err(e);
        }
    };

    for (service, port) in gateway.listener_ports() {
        info!(service = %service, port, "Routing service");
    }
    info!(addr = %gateway.admin_addr(), "Admin endpoint ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway_handle = tokio::spawn(gateway.run(shutdown_rx));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Listeners stop first, then every running container is stopped
    if tokio::time::timeout(Duration::from_secs(30), gateway_handle)
        .await
        .is_err()
    {
        warn!("Timed out waiting for services to stop");
    }

    if let Some(stack) = &compose {
        if let Err(e) = stack.down().await {
            warn!(error = %e, "Failed to stop compose services");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        advertise_host = %config.server.advertise_host,
        admin_port = config.server.admin_port,
        listener_ports = %format!("{}-{}", config.server.listener_port_start, config.server.listener_port_end),
        container_ports = %format!("{}-{}", config.server.container_port_start, config.server.container_port_end),
        "Server configuration"
    );
    info!(
        standby_secs = config.defaults.standby_secs,
        reap_interval_secs = config.defaults.reap_interval_secs,
        readiness_timeout_secs = config.defaults.readiness_timeout_secs,
        request_timeout_secs = config.defaults.request_timeout_secs,
        "Lifecycle defaults"
    );
    info!(
        services = config.services.len(),
        overwrites = config.overwrites.len(),
        discovery = config.discovery.register_url.as_deref().unwrap_or("log"),
        "Services"
    );
}
