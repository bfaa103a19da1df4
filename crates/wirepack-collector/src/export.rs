//! Metrics CSV Exporter
//!
//! Appends one row per received batch to a CSV file:
//!
//! ```text
//! ts,topic,msgs,raw_bytes,comp_bytes,ratio,flush_ms,dict_id
//! ```
//!
//! `ts` is epoch milliseconds. The header row is written once when the file
//! is created (or found empty). Export failures are the caller's to log;
//! they never fail a batch.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use wirepack_core::error::{Error, Result};

const CSV_HEADER: &str = "ts,topic,msgs,raw_bytes,comp_bytes,ratio,flush_ms,dict_id\n";

pub struct CsvExporter {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl CsvExporter {
    /// Open (or create) the CSV, writing the header row for a fresh file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::FatalIo(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let fresh = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::FatalIo(format!("{}: {}", path.display(), e)))?;
        if fresh {
            file.write_all(CSV_HEADER.as_bytes())
                .await
                .map_err(Error::Network)?;
            debug!(path = %path.display(), "metrics CSV created");
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one batch row.
    pub async fn record(
        &self,
        topic: &str,
        msgs: u32,
        raw_bytes: u64,
        comp_bytes: u64,
        flush_ms: u64,
        dict_id: u32,
    ) -> Result<()> {
        let ratio = if raw_bytes > 0 {
            comp_bytes as f64 / raw_bytes as f64
        } else {
            0.0
        };
        let row = format!(
            "{},{},{},{},{},{:.4},{},{}\n",
            Utc::now().timestamp_millis(),
            topic,
            msgs,
            raw_bytes,
            comp_bytes,
            ratio,
            flush_ms,
            dict_id
        );
        let mut file = self.file.lock().await;
        file.write_all(row.as_bytes()).await.map_err(Error::Network)?;
        file.flush().await.map_err(Error::Network)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.csv");
        {
            let exporter = CsvExporter::open(&path).await.unwrap();
            exporter.record("t", 10, 1000, 250, 3, 1).await.unwrap();
        }
        {
            let exporter = CsvExporter::open(&path).await.unwrap();
            exporter.record("t", 5, 500, 125, 2, 1).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.trim_end());
        assert_eq!(content.matches("ts,topic").count(), 1);
    }

    #[tokio::test]
    async fn test_row_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.csv");
        let exporter = CsvExporter::open(&path).await.unwrap();
        exporter
            .record("files.json", 100, 4000, 1000, 12, 3)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        let fields: Vec<&str> = row.split(',').collect();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[1], "files.json");
        assert_eq!(fields[2], "100");
        assert_eq!(fields[3], "4000");
        assert_eq!(fields[4], "1000");
        assert_eq!(fields[5], "0.2500");
        assert_eq!(fields[6], "12");
        assert_eq!(fields[7], "3");
    }

    #[tokio::test]
    async fn test_zero_raw_bytes_ratio() {
        let dir = TempDir::new().unwrap();
        let exporter = CsvExporter::open(dir.path().join("m.csv")).await.unwrap();
        exporter.record("t", 1, 0, 0, 0, 0).await.unwrap();
        let content = std::fs::read_to_string(exporter.path()).unwrap();
        assert!(content.lines().nth(1).unwrap().contains("0.0000"));
    }
}
