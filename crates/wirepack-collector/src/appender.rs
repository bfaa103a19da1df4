//! Durable Per-Topic Appends
//!
//! Reconstructed records land in `<out_dir>/<topic>.jsonl`, one canonical
//! record per line. Each topic has its own file handle behind its own lock,
//! so concurrent connections serialize writes to the same topic without
//! contending across topics.
//!
//! Writes reach the OS on every batch. `fsync` is policy-driven on top of
//! that: correctness of the pipeline does not depend on it, but deployments
//! that want crash durability can sync every batch or on an interval.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use wirepack_core::error::{Error, Result};

/// When to fsync the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Leave durability to the OS page cache.
    Never,
    /// fsync after every batch.
    EveryBatch,
    /// fsync at most once per interval.
    Interval(Duration),
}

struct AppendHandle {
    writer: BufWriter<File>,
    last_sync: Instant,
}

/// Append-only writer for reconstructed topic logs.
pub struct TopicAppender {
    out_dir: PathBuf,
    policy: SyncPolicy,
    files: Mutex<HashMap<String, Arc<Mutex<AppendHandle>>>>,
}

impl TopicAppender {
    /// Create the appender, making sure `out_dir` exists.
    pub fn new(out_dir: impl Into<PathBuf>, policy: SyncPolicy) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| Error::FatalIo(format!("{}: {}", out_dir.display(), e)))?;
        Ok(Self {
            out_dir,
            policy,
            files: Mutex::new(HashMap::new()),
        })
    }

    async fn handle(&self, topic: &str) -> Result<Arc<Mutex<AppendHandle>>> {
        let mut files = self.files.lock().await;
        if let Some(handle) = files.get(topic) {
            return Ok(handle.clone());
        }
        let path = self.out_dir.join(format!("{}.jsonl", topic));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(Error::Network)?;
        debug!(topic, path = %path.display(), "opened topic log");
        let handle = Arc::new(Mutex::new(AppendHandle {
            writer: BufWriter::new(file),
            last_sync: Instant::now(),
        }));
        files.insert(topic.to_string(), handle.clone());
        Ok(handle)
    }

    /// Append one batch of records, one line each, and flush to the OS.
    pub async fn append_batch(&self, topic: &str, records: &[&[u8]]) -> Result<()> {
        let handle = self.handle(topic).await?;
        let mut h = handle.lock().await;
        for record in records {
            h.writer.write_all(record).await?;
            h.writer.write_all(b"\n").await?;
        }
        h.writer.flush().await?;

        let due = match self.policy {
            SyncPolicy::Never => false,
            SyncPolicy::EveryBatch => true,
            SyncPolicy::Interval(every) => h.last_sync.elapsed() >= every,
        };
        if due {
            h.writer.get_ref().sync_all().await?;
            h.last_sync = Instant::now();
            trace!(topic, "fsync");
        }
        Ok(())
    }

    /// Flush and sync every open file (shutdown path).
    pub async fn sync_all(&self) -> Result<()> {
        let handles: Vec<Arc<Mutex<AppendHandle>>> =
            self.files.lock().await.values().cloned().collect();
        for handle in handles {
            let mut h = handle.lock().await;
            h.writer.flush().await?;
            h.writer.get_ref().sync_all().await?;
        }
        Ok(())
    }
}
