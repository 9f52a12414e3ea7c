//! nacos-prometheus-sd daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod reconcile;
mod registry;
mod snapshot;
mod types;
mod writer;

use config::Config;
use reconcile::Reconciler;
use registry::NacosRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting nacos-prometheus-sd with config: {:?}", cfg);

    // Registry client and reconciliation loop
    let registry = Arc::new(NacosRegistry::new(&cfg)?);
    let reconciler = Reconciler::new(&cfg, registry);
    tokio::spawn(reconcile::log_health_transitions(reconciler.subscribe()));

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(reconciler.run(cancel.clone()));

    // Graceful Shutdown
    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = loop_handle.await {
        error!("Reconciliation loop terminated abnormally: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
                return;
            }
            Err(e) => error!("Unable to listen for SIGTERM: {}", e),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: std::io::Result<()>) {
    match result {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }
}
