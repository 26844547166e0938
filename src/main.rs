//! matchd: match allocator and fleet controller.
//!
//! Serves the match allocation API and drives the reconciliation loop that
//! keeps the worker-VM pool converged with the cloud provider.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use matchd::cloud::{CloudProvider, MockCloud};
use matchd::matches::MatchStore;
use matchd::{api, AppState, Config, FleetController, Reconciler};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting matchd");

    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let cloud: Arc<dyn CloudProvider> = match config.cloud_provider.as_str() {
        "mock" => {
            warn!("Using the mock cloud provider; no real VMs will be launched");
            Arc::new(MockCloud::new())
        }
        other => anyhow::bail!("unknown cloud provider: {other}"),
    };

    let fleet = Arc::new(FleetController::new(config.clone(), cloud));
    let matches = Arc::new(MatchStore::new());
    let state = AppState::new(config.clone(), Arc::clone(&fleet), Arc::clone(&matches));

    // Reconcile once at startup, then on the configured period.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(fleet, matches);
    let reconciler_handle = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    let app = api::create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the periodic timer; in-flight work may drain.
    let _ = shutdown_tx.send(true);
    let _ = reconciler_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
