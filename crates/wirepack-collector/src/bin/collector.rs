//! Collector binary.
//!
//! Binds the configured address, loads resident dictionaries, and appends
//! reconstructed records to per-topic logs until SIGINT/SIGTERM.
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 3 cannot bind.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wirepack_collector::CollectorServer;
use wirepack_core::{CollectorConfig, MetricsRegistry};
use wirepack_dict::DictStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match CollectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    let dicts = Arc::new(DictStore::new(&config.dict_dir));
    match dicts.load_dir() {
        Ok(count) => info!(count, "dictionaries loaded"),
        Err(e) => warn!(error = %e, "dictionary load failed, frames needing dictionaries will be rejected"),
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let server = match CollectorServer::bind(config, dicts, metrics.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start collector");
            std::process::exit(e.exit_code());
        }
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = stop_tx.send(());
    });

    if let Err(e) = server.run_until(stop_rx).await {
        error!(error = %e, "collector terminated abnormally");
        std::process::exit(e.exit_code());
    }

    let snap = metrics.snapshot();
    info!(
        topics = snap.topics.len(),
        raw_bytes = snap.total_raw_bytes(),
        unknown_dict = snap.unknown_dict,
        corrupt_frames = snap.corrupt_frames,
        "collector stopped"
    );
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
