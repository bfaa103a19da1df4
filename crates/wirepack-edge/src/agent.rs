//! Edge Agent
//!
//! Wires the pipeline together on the edge side:
//!
//! ```text
//! submit(topic, msg)
//!   │ validate topic + size
//!   │ normalize to canonical bytes
//!   ▼
//! TopicBatcher ── size/byte trigger ──┐
//!   ▲                                 │
//!   │ flush ticker (batch_ms / 4)     ▼
//!   └─ age trigger ──────────→ compress + frame ──→ Shipper ──→ collector
//! ```
//!
//! `submit` never blocks on I/O: compression happens on the caller that
//! triggered the flush (or on the ticker task for age flushes), and the
//! framed result is handed to the shipper's queue. Compression and network
//! failures are absorbed and counted; only the caller's own bad input is
//! returned as an error.
//!
//! Shutdown is cooperative: stop the ticker, final-flush every buffer,
//! then give the shipper a bounded grace window to drain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use wirepack_core::error::Result;
use wirepack_core::frame::{encode_frame, FrameHeader, PROTOCOL_VERSION};
use wirepack_core::normalize::normalize;
use wirepack_core::validate::{validate_batch_len, validate_message_len, validate_topic};
use wirepack_core::{EdgeConfig, MetricsRegistry};
use wirepack_dict::{BatchCompressor, DictStore};

use crate::batcher::{BatchPayload, TopicBatcher};
use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::connection::TcpPool;
use crate::shipper::{Shipper, ShipperConfig};

struct AgentInner {
    config: EdgeConfig,
    volatile: HashSet<String>,
    batcher: TopicBatcher,
    compressor: BatchCompressor,
    dicts: Arc<DictStore>,
    shipper: Arc<Shipper>,
    metrics: Arc<MetricsRegistry>,
}

impl AgentInner {
    /// Compress, frame, and hand a flushed batch to the shipper.
    ///
    /// Failure policy: drop the batch, count the error, keep the pipeline
    /// moving.
    fn dispatch(&self, payload: BatchPayload) {
        let started = Instant::now();
        let joined = payload.join();
        if let Err(e) = validate_batch_len(joined.len(), self.config.max_batch_bytes) {
            warn!(topic = %payload.topic, error = %e, "dropping oversized batch");
            self.metrics.record_bad_message();
            return;
        }

        let (dict_id, dict) = match self.dicts.get(&payload.topic) {
            Some((id, bytes)) => (id, Some(bytes)),
            None => (0, None),
        };

        let compressed =
            match self
                .compressor
                .compress(&payload.topic, dict_id, dict.as_deref(), &joined)
            {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!(topic = %payload.topic, error = %e, "compression failed, dropping batch");
                    self.metrics.record_compression_error(&payload.topic);
                    return;
                }
            };

        let header = FrameHeader {
            comp_len: compressed.len() as u64,
            count: payload.count() as u32,
            dict_id,
            level: self.compressor.level(),
            raw_len: joined.len() as u64,
            topic: payload.topic.clone(),
            v: PROTOCOL_VERSION,
        };
        let frame = match encode_frame(&header, &compressed) {
            Ok(frame) => frame,
            Err(e) => {
                error!(topic = %payload.topic, error = %e, "framing failed, dropping batch");
                self.metrics.record_compression_error(&payload.topic);
                return;
            }
        };

        let flush_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_flush(
            &payload.topic,
            payload.count() as u64,
            joined.len() as u64,
            compressed.len() as u64,
            flush_ms,
            dict_id,
        );
        debug!(
            topic = %payload.topic,
            count = payload.count(),
            raw_bytes = joined.len(),
            compressed_bytes = compressed.len(),
            dict_id,
            flush_ms,
            "batch flushed"
        );
        self.shipper.enqueue(&payload.topic, frame);
    }
}

/// Running edge agent. Construct with [`EdgeAgent::start`], feed it with
/// [`EdgeAgent::submit`], stop it with [`EdgeAgent::shutdown`].
pub struct EdgeAgent {
    inner: Arc<AgentInner>,
    shutdown_tx: watch::Sender<bool>,
    ticker: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl EdgeAgent {
    /// Validate config, build the pipeline, and spawn the flush ticker and
    /// shipper worker.
    pub fn start(
        config: EdgeConfig,
        dicts: Arc<DictStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: config.breaker_failures,
            success_threshold: config.breaker_successes,
            open_window: Duration::from_millis(config.breaker_open_ms),
        });
        let pool = Arc::new(TcpPool::new(config.collector_addr()));
        let shipper = Arc::new(Shipper::new(
            ShipperConfig {
                queue_bytes: config.queue_bytes,
                ..ShipperConfig::default()
            },
            breaker,
            pool,
            metrics.clone(),
        ));

        let inner = Arc::new(AgentInner {
            volatile: config.volatile_fields.iter().cloned().collect(),
            batcher: TopicBatcher::new(config.batch_max, config.batch_bytes),
            compressor: BatchCompressor::new(config.compression_level),
            dicts,
            shipper: shipper.clone(),
            metrics,
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ticker = tokio::spawn(Self::flush_ticker(inner.clone(), shutdown_rx.clone()));
        let worker = tokio::spawn(shipper.run(shutdown_rx));

        info!(
            collector = %inner.config.collector_addr(),
            batch_max = inner.config.batch_max,
            batch_ms = inner.config.batch_ms,
            level = inner.config.compression_level,
            dict_topics = inner.dicts.topic_count(),
            "edge agent started"
        );

        Ok(Self {
            inner,
            shutdown_tx,
            ticker: Some(ticker),
            worker: Some(worker),
        })
    }

    /// Sweep aged buffers at a cadence of `batch_ms / 4`, so no non-empty
    /// buffer outlives its age bound by more than a quarter period.
    async fn flush_ticker(inner: Arc<AgentInner>, mut shutdown: watch::Receiver<bool>) {
        let max_age = Duration::from_millis(inner.config.batch_ms);
        let cadence = Duration::from_millis((inner.config.batch_ms / 4).max(1));
        let mut tick = tokio::time::interval(cadence);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for payload in inner.batcher.take_aged(max_age) {
                        inner.dispatch(payload);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("flush ticker stopped");
    }

    /// Validate, normalize, and buffer one message.
    ///
    /// Returns an error only for the caller's own bad input; everything
    /// downstream of batching is absorbed and counted.
    pub fn submit(&self, topic: &str, msg: &Value) -> Result<()> {
        if let Err(e) = validate_topic(topic) {
            self.inner.metrics.record_bad_message();
            return Err(e);
        }
        let canonical = match normalize(msg, &self.inner.volatile) {
            Ok(canonical) => canonical,
            Err(e) => {
                self.inner.metrics.record_bad_message();
                return Err(e);
            }
        };
        if let Err(e) = validate_message_len(canonical.len(), self.inner.config.max_message_bytes) {
            self.inner.metrics.record_bad_message();
            return Err(e);
        }

        for payload in self.inner.batcher.submit(topic, canonical.into()) {
            self.inner.dispatch(payload);
        }
        Ok(())
    }

    /// Flush one topic's buffer immediately, regardless of age or size.
    pub fn flush(&self, topic: &str) {
        if let Some(payload) = self.inner.batcher.flush_topic(topic) {
            self.inner.dispatch(payload);
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    pub fn shipper(&self) -> &Shipper {
        &self.inner.shipper
    }

    /// Graceful shutdown: stop the ticker, final-flush every buffer, then
    /// drain the shipper within the configured grace window. Frames still
    /// pending after the window are counted in `shipper_dropped`.
    pub async fn shutdown(mut self) {
        info!("edge agent shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.await;
        }
        for payload in self.inner.batcher.drain_all() {
            self.inner.dispatch(payload);
        }

        let grace = Duration::from_millis(self.inner.config.shutdown_grace_ms);
        self.inner.shipper.drain(grace).await;

        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        let dropped = self.inner.metrics.shipper_dropped();
        info!(shipper_dropped = dropped, "edge agent stopped");
    }
}
