//! Dictionary Trainer
//!
//! One-shot batch job: reads a per-topic sample corpus, trains a fixed-size
//! zstd dictionary, and writes the `<topic>.dict` / `<topic>.meta` pair.
//! Publishing to a live store is a separate operational step.
//!
//! Training quality needs roughly 200x the dictionary size in sample bytes.
//! Below that threshold the preferred algorithm is unreliable, so the
//! trainer falls back to using the first `dict_size` bytes of the joined
//! samples as a raw prefix dictionary. That fallback compresses markedly
//! worse; it is flagged loudly in the log and in the metadata so nobody
//! mistakes it for a trained dictionary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use wirepack_core::error::{Error, Result};
use wirepack_core::normalize::normalize;

use crate::store::DictMeta;

/// Sample bytes required per dictionary byte before real training is used.
pub const MIN_SAMPLE_MULTIPLIER: usize = 200;

/// Result of training one topic.
pub struct TrainedDict {
    pub bytes: Vec<u8>,
    /// True when the raw-prefix fallback was used instead of real training.
    pub fallback: bool,
    /// Total sample bytes that went into training.
    pub sample_bytes: usize,
}

/// Train a dictionary from normalized sample records.
pub fn train_from_samples(samples: &[Vec<u8>], dict_size: usize) -> Result<TrainedDict> {
    if samples.is_empty() {
        return Err(Error::Compression("no samples to train from".into()));
    }
    let sample_bytes: usize = samples.iter().map(Vec::len).sum();

    if sample_bytes < dict_size * MIN_SAMPLE_MULTIPLIER {
        warn!(
            sample_bytes,
            needed = dict_size * MIN_SAMPLE_MULTIPLIER,
            "insufficient corpus; falling back to raw prefix dictionary"
        );
        let mut bytes = samples.join(&b'\n');
        bytes.truncate(dict_size);
        return Ok(TrainedDict {
            bytes,
            fallback: true,
            sample_bytes,
        });
    }

    let bytes = zstd::dict::from_samples(samples, dict_size)
        .map_err(|e| Error::Compression(format!("dictionary training failed: {}", e)))?;
    Ok(TrainedDict {
        bytes,
        fallback: false,
        sample_bytes,
    })
}

/// Collect normalized sample records for one topic directory.
///
/// Reads every `*.json` / `*.jsonl` file, one JSON object per line. Lines
/// that fail to parse or normalize are skipped and counted, not fatal: real
/// corpora are messy.
pub fn collect_samples(topic_dir: &Path, volatile: &HashSet<String>) -> Result<Vec<Vec<u8>>> {
    let mut samples = Vec::new();
    let mut skipped = 0usize;

    let mut files: Vec<PathBuf> = std::fs::read_dir(topic_dir)
        .map_err(Error::Network)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("json") | Some("jsonl")
            )
        })
        .collect();
    files.sort();

    for file in files {
        let content = std::fs::read_to_string(&file).map_err(Error::Network)?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            match normalize(&parsed, volatile) {
                Ok(canonical) => samples.push(canonical),
                Err(_) => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        warn!(dir = %topic_dir.display(), skipped, "skipped unparseable sample lines");
    }
    debug!(dir = %topic_dir.display(), count = samples.len(), "samples collected");
    Ok(samples)
}

/// Write the trained dictionary and its metadata into `dict_dir`.
///
/// The assigned `dict_id` continues from any metadata already present for
/// the topic, so re-training publishes a new version rather than reusing
/// the old id.
pub fn write_topic_dict(dict_dir: &Path, topic: &str, trained: &TrainedDict) -> Result<DictMeta> {
    std::fs::create_dir_all(dict_dir).map_err(|e| Error::FatalIo(e.to_string()))?;

    let meta_path = dict_dir.join(format!("{}.meta", topic));
    let next_id = match std::fs::read(&meta_path) {
        Ok(raw) => serde_json::from_slice::<DictMeta>(&raw)
            .map(|m| m.dict_id + 1)
            .unwrap_or(1),
        Err(_) => 1,
    };

    let meta = DictMeta {
        dict_id: next_id,
        created_at: Utc::now(),
        size: trained.bytes.len(),
        fallback: trained.fallback,
    };

    std::fs::write(dict_dir.join(format!("{}.dict", topic)), &trained.bytes)
        .map_err(|e| Error::FatalIo(e.to_string()))?;
    std::fs::write(
        &meta_path,
        serde_json::to_vec(&meta).map_err(|e| Error::FatalIo(e.to_string()))?,
    )
    .map_err(|e| Error::FatalIo(e.to_string()))?;

    info!(
        topic,
        dict_id = meta.dict_id,
        size = meta.size,
        fallback = meta.fallback,
        "dictionary written"
    );
    Ok(meta)
}
