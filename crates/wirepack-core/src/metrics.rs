//! Metrics Aggregator
//!
//! Thread-safe counters per topic plus pipeline-level counters, owned
//! explicitly by whoever constructs the pipeline and shared via `Arc`; there
//! is no global registry. Counter updates are lock-free atomic adds; the
//! topic map takes a read lock only to find the entry.
//!
//! `snapshot()` produces a stable point-in-time view with the derived values
//! (compression ratio, throughput) computed on read, so tests and exporters
//! never see half-updated state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

/// Per-topic counters. All fields are cumulative since process start.
#[derive(Debug, Default)]
pub struct TopicMetrics {
    pub messages_in: AtomicU64,
    pub bytes_raw_in: AtomicU64,
    pub bytes_comp_out: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_ms_sum: AtomicU64,
    pub compression_errors: AtomicU64,
    pub network_errors: AtomicU64,
    /// dict_id used by the most recent flush.
    pub last_dict_id: AtomicU64,
}

/// Pipeline-wide metrics registry.
pub struct MetricsRegistry {
    topics: RwLock<HashMap<String, Arc<TopicMetrics>>>,
    shipper_dropped: AtomicU64,
    bad_messages: AtomicU64,
    unknown_dict: AtomicU64,
    corrupt_frames: AtomicU64,
    frame_errors: AtomicU64,
    breaker_opened: AtomicU64,
    breaker_half_opened: AtomicU64,
    breaker_closed: AtomicU64,
    started_at: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            shipper_dropped: AtomicU64::new(0),
            bad_messages: AtomicU64::new(0),
            unknown_dict: AtomicU64::new(0),
            corrupt_frames: AtomicU64::new(0),
            frame_errors: AtomicU64::new(0),
            breaker_opened: AtomicU64::new(0),
            breaker_half_opened: AtomicU64::new(0),
            breaker_closed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Get or create the counter block for a topic.
    pub fn topic(&self, topic: &str) -> Arc<TopicMetrics> {
        if let Some(existing) = self.topics.read().unwrap().get(topic) {
            return existing.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicMetrics::default()))
            .clone()
    }

    /// Record a flushed batch.
    pub fn record_flush(
        &self,
        topic: &str,
        count: u64,
        raw_bytes: u64,
        comp_bytes: u64,
        flush_ms: u64,
        dict_id: u32,
    ) {
        let t = self.topic(topic);
        t.messages_in.fetch_add(count, Ordering::Relaxed);
        t.bytes_raw_in.fetch_add(raw_bytes, Ordering::Relaxed);
        t.bytes_comp_out.fetch_add(comp_bytes, Ordering::Relaxed);
        t.flushes.fetch_add(1, Ordering::Relaxed);
        t.flush_ms_sum.fetch_add(flush_ms, Ordering::Relaxed);
        t.last_dict_id.store(u64::from(dict_id), Ordering::Relaxed);
    }

    pub fn record_compression_error(&self, topic: &str) {
        self.topic(topic)
            .compression_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self, topic: &str) {
        self.topic(topic)
            .network_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_message(&self) {
        self.bad_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, frames: u64) {
        self.shipper_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn record_unknown_dict(&self) {
        self.unknown_dict.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_frame(&self) {
        self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_error(&self) {
        self.frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a circuit breaker transition so tests can observe the FSM.
    pub fn record_breaker_transition(&self, state: &'static str) {
        match state {
            "open" => self.breaker_opened.fetch_add(1, Ordering::Relaxed),
            "half_open" => self.breaker_half_opened.fetch_add(1, Ordering::Relaxed),
            "closed" => self.breaker_closed.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn shipper_dropped(&self) -> u64 {
        self.shipper_dropped.load(Ordering::Relaxed)
    }

    /// Stable point-in-time view of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let topics = self.topics.read().unwrap();
        let mut rows: Vec<TopicSnapshot> = topics
            .iter()
            .map(|(name, t)| TopicSnapshot {
                topic: name.clone(),
                messages_in: t.messages_in.load(Ordering::Relaxed),
                bytes_raw_in: t.bytes_raw_in.load(Ordering::Relaxed),
                bytes_comp_out: t.bytes_comp_out.load(Ordering::Relaxed),
                flushes: t.flushes.load(Ordering::Relaxed),
                flush_ms_sum: t.flush_ms_sum.load(Ordering::Relaxed),
                compression_errors: t.compression_errors.load(Ordering::Relaxed),
                network_errors: t.network_errors.load(Ordering::Relaxed),
                dict_id: t.last_dict_id.load(Ordering::Relaxed) as u32,
            })
            .collect();
        rows.sort_by(|a, b| a.topic.cmp(&b.topic));

        let uptime_ms = self.started_at.elapsed().as_millis() as u64;
        MetricsSnapshot {
            topics: rows,
            shipper_dropped: self.shipper_dropped.load(Ordering::Relaxed),
            bad_messages: self.bad_messages.load(Ordering::Relaxed),
            unknown_dict: self.unknown_dict.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            breaker_opened: self.breaker_opened.load(Ordering::Relaxed),
            breaker_half_opened: self.breaker_half_opened.load(Ordering::Relaxed),
            breaker_closed: self.breaker_closed.load(Ordering::Relaxed),
            uptime_ms,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time counters for one topic.
#[derive(Debug, Clone, Serialize)]
pub struct TopicSnapshot {
    pub topic: String,
    pub messages_in: u64,
    pub bytes_raw_in: u64,
    pub bytes_comp_out: u64,
    pub flushes: u64,
    pub flush_ms_sum: u64,
    pub compression_errors: u64,
    pub network_errors: u64,
    pub dict_id: u32,
}

impl TopicSnapshot {
    /// Compressed-over-raw; 0.0 before any bytes have flowed.
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_raw_in == 0 {
            return 0.0;
        }
        self.bytes_comp_out as f64 / self.bytes_raw_in as f64
    }

    pub fn avg_flush_ms(&self) -> f64 {
        if self.flushes == 0 {
            return 0.0;
        }
        self.flush_ms_sum as f64 / self.flushes as f64
    }
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub topics: Vec<TopicSnapshot>,
    pub shipper_dropped: u64,
    pub bad_messages: u64,
    pub unknown_dict: u64,
    pub corrupt_frames: u64,
    pub frame_errors: u64,
    pub breaker_opened: u64,
    pub breaker_half_opened: u64,
    pub breaker_closed: u64,
    pub uptime_ms: u64,
}

impl MetricsSnapshot {
    pub fn total_raw_bytes(&self) -> u64 {
        self.topics.iter().map(|t| t.bytes_raw_in).sum()
    }

    pub fn total_comp_bytes(&self) -> u64 {
        self.topics.iter().map(|t| t.bytes_comp_out).sum()
    }

    pub fn overall_compression_ratio(&self) -> f64 {
        let raw = self.total_raw_bytes();
        if raw == 0 {
            return 0.0;
        }
        self.total_comp_bytes() as f64 / raw as f64
    }

    /// Raw ingest throughput in bytes per second since startup.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        if self.uptime_ms == 0 {
            return 0.0;
        }
        self.total_raw_bytes() as f64 / (self.uptime_ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_flush_accumulates() {
        let reg = MetricsRegistry::new();
        reg.record_flush("sensors.temp", 100, 5000, 1250, 15, 1);
        reg.record_flush("sensors.temp", 50, 2500, 625, 5, 1);

        let snap = reg.snapshot();
        assert_eq!(snap.topics.len(), 1);
        let t = &snap.topics[0];
        assert_eq!(t.messages_in, 150);
        assert_eq!(t.bytes_raw_in, 7500);
        assert_eq!(t.bytes_comp_out, 1875);
        assert_eq!(t.flushes, 2);
        assert_eq!(t.flush_ms_sum, 20);
        assert_eq!(t.dict_id, 1);
    }

    #[test]
    fn test_compression_ratio_derived() {
        let reg = MetricsRegistry::new();
        reg.record_flush("t", 1, 4000, 1000, 1, 0);
        let snap = reg.snapshot();
        assert!((snap.topics[0].compression_ratio() - 0.25).abs() < f64::EPSILON);
        assert!((snap.overall_compression_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ratio_zero_before_traffic() {
        let reg = MetricsRegistry::new();
        let _ = reg.topic("quiet");
        let snap = reg.snapshot();
        assert_eq!(snap.topics[0].compression_ratio(), 0.0);
        assert_eq!(snap.overall_compression_ratio(), 0.0);
    }

    #[test]
    fn test_topics_sorted_in_snapshot() {
        let reg = MetricsRegistry::new();
        reg.record_flush("zz", 1, 1, 1, 1, 0);
        reg.record_flush("aa", 1, 1, 1, 1, 0);
        reg.record_flush("mm", 1, 1, 1, 1, 0);
        let names: Vec<_> = reg.snapshot().topics.into_iter().map(|t| t.topic).collect();
        assert_eq!(names, vec!["aa", "mm", "zz"]);
    }

    #[test]
    fn test_error_counters() {
        let reg = MetricsRegistry::new();
        reg.record_compression_error("t");
        reg.record_network_error("t");
        reg.record_network_error("t");
        reg.record_bad_message();
        reg.record_unknown_dict();
        reg.record_corrupt_frame();
        reg.record_frame_error();
        reg.record_dropped(3);

        let snap = reg.snapshot();
        assert_eq!(snap.topics[0].compression_errors, 1);
        assert_eq!(snap.topics[0].network_errors, 2);
        assert_eq!(snap.bad_messages, 1);
        assert_eq!(snap.unknown_dict, 1);
        assert_eq!(snap.corrupt_frames, 1);
        assert_eq!(snap.frame_errors, 1);
        assert_eq!(snap.shipper_dropped, 3);
    }

    #[test]
    fn test_breaker_transitions_observable() {
        let reg = MetricsRegistry::new();
        reg.record_breaker_transition("open");
        reg.record_breaker_transition("half_open");
        reg.record_breaker_transition("closed");
        reg.record_breaker_transition("open");
        let snap = reg.snapshot();
        assert_eq!(snap.breaker_opened, 2);
        assert_eq!(snap.breaker_half_opened, 1);
        assert_eq!(snap.breaker_closed, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let reg = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    reg.record_flush("hot", 1, 10, 3, 1, 2);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = reg.snapshot();
        assert_eq!(snap.topics[0].messages_in, 8000);
        assert_eq!(snap.topics[0].bytes_raw_in, 80_000);
    }

    #[test]
    fn test_avg_flush_ms() {
        let reg = MetricsRegistry::new();
        reg.record_flush("t", 1, 1, 1, 10, 0);
        reg.record_flush("t", 1, 1, 1, 20, 0);
        let snap = reg.snapshot();
        assert!((snap.topics[0].avg_flush_ms() - 15.0).abs() < f64::EPSILON);
    }
}
