//! Collector Server
//!
//! Accepts TCP connections from edge agents and inverts the pipeline:
//!
//! ```text
//! wire ──→ deframe ──→ validate header ──→ dictionary lookup
//!                                               │
//!                              sidecar load on miss, else reject
//!                                               ▼
//!          <out_dir>/<topic>.jsonl ←── split 0x0A ←── decompress (raw_len)
//! ```
//!
//! Each connection runs in its own task. Error handling per frame:
//!
//! - framing errors close the connection
//! - an unknown dictionary rejects the frame but keeps the connection up,
//!   since framing stayed valid
//! - a length mismatch or decoder error is a corrupt frame and closes the
//!   connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use wirepack_core::error::{Error, Result};
use wirepack_core::frame::{read_frame, FrameHeader};
use wirepack_core::{CollectorConfig, MetricsRegistry};
use wirepack_dict::{BatchDecompressor, DictStore};

use crate::appender::{SyncPolicy, TopicAppender};
use crate::export::CsvExporter;

/// Shared state for all collector connections.
pub struct CollectorState {
    pub dicts: Arc<DictStore>,
    pub metrics: Arc<MetricsRegistry>,
    codec: BatchDecompressor,
    appender: TopicAppender,
    exporter: Option<CsvExporter>,
}

/// Collector bound to its listen socket.
pub struct CollectorServer {
    listener: TcpListener,
    state: Arc<CollectorState>,
}

impl std::fmt::Debug for CollectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorServer")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl CollectorServer {
    /// Bind the listener and prepare output files. A failed bind or
    /// unwritable output directory is fatal (exit code 3).
    pub async fn bind(
        config: CollectorConfig,
        dicts: Arc<DictStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::FatalIo(format!("cannot bind {}: {}", addr, e)))?;

        let policy = if config.fsync_ms == 0 {
            SyncPolicy::Never
        } else {
            SyncPolicy::Interval(Duration::from_millis(config.fsync_ms))
        };
        let appender = TopicAppender::new(&config.out_dir, policy)?;
        let exporter = match &config.metrics_csv {
            Some(path) => Some(CsvExporter::open(path).await?),
            None => None,
        };

        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or(addr),
            out_dir = %config.out_dir.display(),
            dict_topics = dicts.topic_count(),
            "collector listening"
        );

        Ok(Self {
            listener,
            state: Arc::new(CollectorState {
                dicts,
                metrics,
                codec: BatchDecompressor::new(),
                appender,
                exporter,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Network)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run_until(self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(client = %addr, "connection accepted");
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                match handle_connection(stream, addr, state).await {
                                    Ok(()) => debug!(client = %addr, "connection closed"),
                                    Err(e) => warn!(client = %addr, error = %e, "connection error"),
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("collector shutting down");
                    break;
                }
            }
        }
        self.state.appender.sync_all().await?;
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<CollectorState>,
) -> Result<()> {
    loop {
        let (header, payload) = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                state.metrics.record_frame_error();
                return Err(e);
            }
        };

        match store_batch(&state, &header, &payload).await {
            Ok(flush_ms) => {
                info!(
                    client = %addr,
                    topic = %header.topic,
                    count = header.count,
                    raw_bytes = header.raw_len,
                    compressed_bytes = header.comp_len,
                    dict_id = header.dict_id,
                    flush_ms,
                    "batch received"
                );
            }
            // Frame rejected but framing stayed valid: keep the connection.
            Err(Error::UnknownDict { topic, dict_id }) => {
                state.metrics.record_unknown_dict();
                warn!(client = %addr, topic = %topic, dict_id, "rejected frame: unknown dictionary");
            }
            Err(e @ Error::CorruptFrame(_)) => {
                state.metrics.record_corrupt_frame();
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decompress, split, and append one frame. Returns processing time in ms.
async fn store_batch(state: &CollectorState, header: &FrameHeader, payload: &Bytes) -> Result<u64> {
    let started = Instant::now();

    let dict = if header.dict_id == 0 {
        None
    } else {
        match state.dicts.get_by_id(&header.topic, header.dict_id) {
            Some(dict) => Some(dict),
            None => match state.dicts.load_sidecar(&header.topic, header.dict_id) {
                Ok(Some(dict)) => Some(dict),
                _ => {
                    return Err(Error::UnknownDict {
                        topic: header.topic.clone(),
                        dict_id: header.dict_id,
                    })
                }
            },
        }
    };

    let joined = state.codec.decompress(
        &header.topic,
        header.dict_id,
        dict.as_deref(),
        payload,
        header.raw_len as usize,
    )?;

    let records: Vec<&[u8]> = joined.split(|b| *b == 0x0A).collect();
    if records.len() != header.count as usize {
        return Err(Error::CorruptFrame(format!(
            "batch split into {} records, header claims {}",
            records.len(),
            header.count
        )));
    }
    if records.iter().any(|r| r.is_empty()) {
        return Err(Error::CorruptFrame("batch contains empty record".into()));
    }

    state.appender.append_batch(&header.topic, &records).await?;

    let flush_ms = started.elapsed().as_millis() as u64;
    state.metrics.record_flush(
        &header.topic,
        u64::from(header.count),
        header.raw_len,
        header.comp_len,
        flush_ms,
        header.dict_id,
    );
    if let Some(exporter) = &state.exporter {
        if let Err(e) = exporter
            .record(
                &header.topic,
                header.count,
                header.raw_len,
                header.comp_len,
                flush_ms,
                header.dict_id,
            )
            .await
        {
            warn!(error = %e, "metrics CSV append failed");
        }
    }
    Ok(flush_ms)
}
