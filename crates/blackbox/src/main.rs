//! Vehicle Blackbox - Main Entry Point

use anyhow::Context;
use blackbox::{
    init_logging, install_metrics_exporter, BlackboxConfig, Collaborators, Pipeline,
    SimulatedSource,
};
use cloud_sync::{ConnectivityMonitor, MqttPublisher, Publisher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

const DEFAULT_CONFIG: &str = "blackbox.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BLACKBOX_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = BlackboxConfig::load(Some(&config_path))
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    init_logging(&config.logging)?;
    if let Some(port) = config.metrics_port {
        install_metrics_exporter(port)?;
    }

    info!("=== Vehicle Blackbox v{} ===", env!("CARGO_PKG_VERSION"));
    info!(config = %config_path.display(), "Starting blackbox...");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Arc::new(ConnectivityMonitor::new(config.connectivity.clone()));
    let publisher: Option<Arc<dyn Publisher>> = if config.pipeline.cloud_enabled {
        Some(Arc::new(MqttPublisher::start(&config.mqtt, shutdown_rx.clone())))
    } else {
        None
    };

    let collaborators = Collaborators {
        source: Arc::new(SimulatedSource::new(config.simulation.clone())),
        publisher,
        connectivity: monitor.clone(),
        monitor: Some(monitor),
    };

    let pipeline = Pipeline::start(config, collaborators, shutdown_rx)
        .await
        .context("Failed to start pipeline")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    pipeline.stop(&shutdown_tx).await;

    info!("Blackbox stopped");
    Ok(())
}
