//! Dictionary training tool.
//!
//! Walks `--samples-root/<topic>/*.json[l]`, trains one dictionary per topic,
//! and writes `<topic>.dict` / `<topic>.meta` pairs into `--dict-dir`.
//!
//! ```bash
//! train --samples-root ./samples --dict-dir ./dicts --size 4096
//! ```

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wirepack_core::validate::validate_topic;
use wirepack_dict::trainer::{collect_samples, train_from_samples, write_topic_dict};

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train per-topic compression dictionaries from sample corpora")]
struct Args {
    /// Root directory containing one subdirectory of JSONL samples per topic.
    #[arg(long)]
    samples_root: PathBuf,

    /// Output directory for dictionaries and metadata.
    #[arg(long)]
    dict_dir: PathBuf,

    /// Dictionary size in bytes.
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Volatile keys stripped from samples before training; repeatable.
    #[arg(long = "volatile", default_values_t = vec!["X-Amzn-Trace-Id".to_string()])]
    volatile: Vec<String>,
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("tracing init");

    let args = Args::parse();
    let volatile: HashSet<String> = args.volatile.iter().cloned().collect();

    let topics = match std::fs::read_dir(&args.samples_root) {
        Ok(entries) => entries,
        Err(e) => {
            error!(root = %args.samples_root.display(), error = %e, "cannot read samples root");
            std::process::exit(2);
        }
    };

    let mut trained = 0usize;
    let mut fallbacks = 0usize;
    for entry in topics.flatten() {
        let topic_dir = entry.path();
        if !topic_dir.is_dir() {
            continue;
        }
        let Some(topic) = topic_dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
            continue;
        };
        if let Err(e) = validate_topic(&topic) {
            warn!(topic, error = %e, "skipping directory with invalid topic name");
            continue;
        }

        let samples = match collect_samples(&topic_dir, &volatile) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => {
                warn!(topic, "no usable samples, skipping");
                continue;
            }
            Err(e) => {
                warn!(topic, error = %e, "failed to read samples, skipping");
                continue;
            }
        };

        let result = match train_from_samples(&samples, args.size) {
            Ok(result) => result,
            Err(e) => {
                warn!(topic, error = %e, "training failed, skipping");
                continue;
            }
        };
        if result.fallback {
            fallbacks += 1;
        }

        match write_topic_dict(&args.dict_dir, &topic, &result) {
            Ok(meta) => {
                info!(
                    topic,
                    dict_id = meta.dict_id,
                    size = meta.size,
                    samples = samples.len(),
                    sample_bytes = result.sample_bytes,
                    fallback = meta.fallback,
                    "dictionary trained"
                );
                trained += 1;
            }
            Err(e) => {
                error!(topic, error = %e, "failed to write dictionary");
                std::process::exit(3);
            }
        }
    }

    if fallbacks > 0 {
        warn!(
            fallbacks,
            "some topics used the raw-prefix fallback; expect degraded compression until more samples are collected"
        );
    }
    info!(trained, dict_dir = %args.dict_dir.display(), "training complete");
}
