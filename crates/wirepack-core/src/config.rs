//! Pipeline Configuration
//!
//! Configuration is constructed once at startup and passed explicitly into
//! each component; there is no cached global settings accessor. Every field
//! has a serde default so partial config files work, and `from_env()` applies
//! `EDGE_`-prefixed environment overrides on top of the defaults:
//!
//! ```text
//! EDGE_COLLECTOR_HOST=collector.internal EDGE_BATCH_MS=100 edge
//! ```
//!
//! Unparseable values are a [`Error::FatalConfig`], which binaries map to
//! exit code 2.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable prefix shared by both binaries.
pub const ENV_PREFIX: &str = "EDGE_";

/// Edge agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Collector hostname or IP.
    #[serde(default = "default_collector_host")]
    pub collector_host: String,

    /// Collector port.
    #[serde(default = "default_collector_port")]
    pub collector_port: u16,

    /// Maximum records per batch.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Maximum batch age in milliseconds before a timer flush.
    #[serde(default = "default_batch_ms")]
    pub batch_ms: u64,

    /// Joined-batch byte ceiling; a submit that would exceed it flushes first.
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: usize,

    /// Zstandard compression level (1-22).
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Directory holding `<topic>.dict` / `<topic>.meta` pairs.
    #[serde(default = "default_dict_dir")]
    pub dict_dir: PathBuf,

    /// Largest single canonical message accepted.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Largest joined batch accepted.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Consecutive send failures before the breaker opens.
    #[serde(default = "default_breaker_failures")]
    pub breaker_failures: u32,

    /// Milliseconds the breaker stays open before probing.
    #[serde(default = "default_breaker_open_ms")]
    pub breaker_open_ms: u64,

    /// Probe successes required to close the breaker again.
    #[serde(default = "default_breaker_successes")]
    pub breaker_successes: u32,

    /// Shutdown drain window for the shipper, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Byte bound on the shipper's pending-frame queue.
    #[serde(default = "default_queue_bytes")]
    pub queue_bytes: usize,

    /// Keys stripped from messages at every nesting level.
    #[serde(default = "default_volatile_fields")]
    pub volatile_fields: Vec<String>,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            collector_host: default_collector_host(),
            collector_port: default_collector_port(),
            batch_max: default_batch_max(),
            batch_ms: default_batch_ms(),
            batch_bytes: default_batch_bytes(),
            compression_level: default_compression_level(),
            dict_dir: default_dict_dir(),
            max_message_bytes: default_max_message_bytes(),
            max_batch_bytes: default_max_batch_bytes(),
            breaker_failures: default_breaker_failures(),
            breaker_open_ms: default_breaker_open_ms(),
            breaker_successes: default_breaker_successes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            queue_bytes: default_queue_bytes(),
            volatile_fields: default_volatile_fields(),
        }
    }
}

impl EdgeConfig {
    /// Defaults overlaid with `EDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        overlay(&mut cfg.collector_host, "COLLECTOR_HOST")?;
        overlay(&mut cfg.collector_port, "COLLECTOR_PORT")?;
        overlay(&mut cfg.batch_max, "BATCH_MAX")?;
        overlay(&mut cfg.batch_ms, "BATCH_MS")?;
        overlay(&mut cfg.batch_bytes, "BATCH_BYTES")?;
        overlay(&mut cfg.compression_level, "COMPRESSION_LEVEL")?;
        overlay(&mut cfg.dict_dir, "DICT_DIR")?;
        overlay(&mut cfg.max_message_bytes, "MAX_MESSAGE_BYTES")?;
        overlay(&mut cfg.max_batch_bytes, "MAX_BATCH_BYTES")?;
        overlay(&mut cfg.breaker_failures, "BREAKER_FAILURES")?;
        overlay(&mut cfg.breaker_open_ms, "BREAKER_OPEN_MS")?;
        overlay(&mut cfg.breaker_successes, "BREAKER_SUCCESSES")?;
        overlay(&mut cfg.shutdown_grace_ms, "SHUTDOWN_GRACE_MS")?;
        overlay(&mut cfg.queue_bytes, "QUEUE_BYTES")?;
        if let Ok(raw) = std::env::var(format!("{}VOLATILE_FIELDS", ENV_PREFIX)) {
            cfg.volatile_fields = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// `host:port` of the collector.
    pub fn collector_addr(&self) -> String {
        format!("{}:{}", self.collector_host, self.collector_port)
    }

    /// Range-check the assembled configuration.
    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::FatalConfig(format!(
                "compression_level {} outside 1..=22",
                self.compression_level
            )));
        }
        if self.batch_max == 0 {
            return Err(Error::FatalConfig("batch_max must be >= 1".into()));
        }
        if self.batch_ms == 0 {
            return Err(Error::FatalConfig("batch_ms must be >= 1".into()));
        }
        if self.batch_bytes == 0 {
            return Err(Error::FatalConfig("batch_bytes must be >= 1".into()));
        }
        if self.collector_port == 0 {
            return Err(Error::FatalConfig("collector_port must be nonzero".into()));
        }
        Ok(())
    }
}

/// Collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Bind address for the listener.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Bind port for the listener.
    #[serde(default = "default_collector_port")]
    pub bind_port: u16,

    /// Root directory for reconstructed `<topic>.jsonl` output.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Dictionary directory, also used for sidecar lookups.
    #[serde(default = "default_dict_dir")]
    pub dict_dir: PathBuf,

    /// Optional metrics CSV path; empty disables the exporter.
    #[serde(default = "default_metrics_csv")]
    pub metrics_csv: Option<PathBuf>,

    /// fsync cadence for output files in milliseconds; 0 leaves durability
    /// to the OS page cache.
    #[serde(default)]
    pub fsync_ms: u64,

    /// Largest joined batch accepted from the wire.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_collector_port(),
            out_dir: default_out_dir(),
            dict_dir: default_dict_dir(),
            metrics_csv: default_metrics_csv(),
            fsync_ms: 0,
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl CollectorConfig {
    /// Defaults overlaid with `EDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        overlay(&mut cfg.bind_host, "BIND_HOST")?;
        overlay(&mut cfg.bind_port, "BIND_PORT")?;
        overlay(&mut cfg.out_dir, "OUT_DIR")?;
        overlay(&mut cfg.dict_dir, "DICT_DIR")?;
        overlay(&mut cfg.fsync_ms, "FSYNC_MS")?;
        overlay(&mut cfg.max_batch_bytes, "MAX_BATCH_BYTES")?;
        if let Ok(raw) = std::env::var(format!("{}METRICS_CSV", ENV_PREFIX)) {
            cfg.metrics_csv = if raw.is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }
        if cfg.bind_port == 0 {
            return Err(Error::FatalConfig("bind_port must be nonzero".into()));
        }
        Ok(cfg)
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

/// Apply `EDGE_<KEY>` to `target` if set, failing on unparseable values.
fn overlay<T>(target: &mut T, key: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let var = format!("{}{}", ENV_PREFIX, key);
    if let Ok(raw) = std::env::var(&var) {
        *target = raw
            .parse()
            .map_err(|e| Error::FatalConfig(format!("{}={}: {}", var, raw, e)))?;
    }
    Ok(())
}

fn default_collector_host() -> String {
    "127.0.0.1".into()
}

fn default_collector_port() -> u16 {
    7000
}

fn default_bind_host() -> String {
    "0.0.0.0".into()
}

fn default_batch_max() -> usize {
    100
}

fn default_batch_ms() -> u64 {
    250
}

fn default_batch_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_compression_level() -> i32 {
    7
}

fn default_dict_dir() -> PathBuf {
    PathBuf::from("./dicts")
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("./out")
}

fn default_metrics_csv() -> Option<PathBuf> {
    Some(PathBuf::from("./metrics.csv"))
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_batch_bytes() -> usize {
    100 * 1024 * 1024 // 100 MiB
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_open_ms() -> u64 {
    30_000
}

fn default_breaker_successes() -> u32 {
    2
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_queue_bytes() -> usize {
    64 * 1024 * 1024 // 64 MiB of pending frames
}

fn default_volatile_fields() -> Vec<String> {
    vec!["X-Amzn-Trace-Id".into()]
}
