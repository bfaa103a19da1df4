//! Edge agent binary.
//!
//! Loads configuration from `EDGE_*` environment variables, loads the
//! dictionary store, and runs a synthetic file-telemetry feed against the
//! configured collector until SIGINT/SIGTERM.
//!
//! Exit codes: 0 clean shutdown, 2 configuration error.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wirepack_core::{EdgeConfig, MetricsRegistry};
use wirepack_dict::DictStore;
use wirepack_edge::EdgeAgent;

const FEED_TOPICS: [&str; 3] = ["files.txt", "files.csv", "files.json"];

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match EdgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(e.exit_code());
        }
    };

    let dicts = Arc::new(DictStore::new(&config.dict_dir));
    match dicts.load_dir() {
        Ok(count) => info!(count, "dictionaries loaded"),
        Err(e) => warn!(error = %e, "dictionary load failed, shipping without dictionaries"),
    }

    let metrics = Arc::new(MetricsRegistry::new());
    let agent = match EdgeAgent::start(config, dicts, metrics.clone()) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "failed to start edge agent");
            std::process::exit(e.exit_code());
        }
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut feed = tokio::time::interval(Duration::from_millis(5));
    loop {
        tokio::select! {
            _ = feed.tick() => {
                for topic in FEED_TOPICS {
                    if let Err(e) = agent.submit(topic, &synth_message(topic)) {
                        warn!(topic, error = %e, "message rejected");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    agent.shutdown().await;

    let snap = metrics.snapshot();
    info!(
        topics = snap.topics.len(),
        raw_bytes = snap.total_raw_bytes(),
        comp_bytes = snap.total_comp_bytes(),
        ratio = format!("{:.2}", snap.overall_compression_ratio()),
        dropped = snap.shipper_dropped,
        "final metrics"
    );
}

/// Fake file-metadata telemetry in the shape real agents produce, including
/// a volatile trace header the normalizer strips.
fn synth_message(topic: &str) -> serde_json::Value {
    let mut rng = rand::thread_rng();
    let ext = topic.rsplit('.').next().unwrap_or("dat");
    let name: String = (0..8)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    let checksum: String = (0..8)
        .map(|_| {
            let digits = b"abcdef0123456789";
            digits[rng.gen_range(0..digits.len())] as char
        })
        .collect();

    json!({
        "file_type": ext,
        "path": format!("/var/log/{}/{}.{}", topic, name, ext),
        "size": rng.gen_range(10..10_000),
        "checksum": checksum,
        "headers": {
            "Accept": "*/*",
            "User-Agent": "wirepack-edge/0.2",
            "X-Amzn-Trace-Id": format!(
                "Root={}-{}",
                rng.gen_range(1..100_000_000u64),
                rng.gen_range(10_000_000_000_000_000u64..100_000_000_000_000_000u64)
            ),
        },
    })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
