//! Service Catalog Controller
//!
//! Runs the reconcilers for brokers, classes, plans, instances and bindings
//! until SIGINT.

use kube::Client;
use service_catalog_controller::{Controller, ControllerConfig, ControllerError};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and reqwest both pull in rustls; pick the provider once
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Service Catalog Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers per kind: {}", config.concurrent_syncs);
    info!("  Broker relist interval: {:?}", config.broker_relist_interval);
    info!("  Metrics address: {}", config.metrics_addr);

    let client = Client::try_default().await?;
    let controller = Controller::new(client, config)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        // Receivers treat a dropped sender as shutdown too
        let _ = stop_tx.send(true);
    });

    controller.run(stop_rx).await
}
