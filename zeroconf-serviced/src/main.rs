mod api;
mod broker;
mod config;
mod mdns;
mod netwatch;
mod registry;
mod serializer;
mod session;

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use shared::types::Record;
use crate::config::Config;
use crate::mdns::advertise::Advertiser;
use crate::mdns::MdnsResolver;
use crate::serializer::RegistryHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("zeroconf_serviced=info"))
        )
        .init();

    tracing::info!("Starting zeroconf-serviced");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/zeroconf/serviced.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Digest of the empty registry
    let empty: [&Record; 0] = [];
    let (digest_tx, digest_rx) = watch::channel(registry::hash::compute_digest(empty));

    // Start serializer thread
    let registry = RegistryHandle::spawn(Arc::new(MdnsResolver), digest_tx);

    // Create mDNS daemon; interfaces are enabled per discovery session
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    mdns_daemon
        .disable_interface(mdns_sd::IfKind::All)
        .context("Failed to disable default interfaces")?;

    // Advertiser for client registrations
    let advertiser = Advertiser::new(mdns_daemon.clone(), config.advertise.hostname.clone())?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn interface watcher, which owns the discovery session
    let watch_cancel = cancel.clone();
    let watch_daemon = mdns_daemon.clone();
    let watch_registry = registry.clone();
    let watch_config = config.discovery.clone();
    let watch_handle = tokio::spawn(async move {
        if let Err(e) = netwatch::run(watch_daemon, watch_config, watch_registry, watch_cancel).await {
            tracing::error!("Interface watcher error: {:#}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        digest_rx,
        advertiser,
        subscriber_queue: config.broker.subscriber_queue,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // The watcher stops the running session, which clears the registry
    let _ = tokio::join!(watch_handle, server_handle);

    // Shutdown serializer thread
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown serializer: {}", e);
    }

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
