//! Per-Topic Batching
//!
//! Records accumulate in per-topic buffers until one of two triggers fires:
//!
//! - **Size**: the buffer reaches `batch_max` records, or inserting the next
//!   record would push the joined batch past the `batch_bytes` ceiling (in
//!   which case the buffer flushes *before* the insert).
//! - **Age**: a background tick sweeps out every non-empty buffer older than
//!   `batch_ms`.
//!
//! ```text
//! submit("files.json", rec)
//!        │
//!        ▼
//! ┌───────────────────────────────┐
//! │ TopicBuffer "files.json"      │  per-topic lock
//! │  records: Vec<Bytes>          │
//! │  raw_len, first_at            │
//! └──────┬────────────────────────┘
//!        ├─→ would exceed batch_bytes → flush first, then insert
//!        ├─→ count == batch_max       → flush after insert
//!        └─→ tick: age >= batch_ms    → flush
//! ```
//!
//! Each topic's buffer has its own lock, so producers on distinct topics
//! never contend, and a flush holds the lock only long enough to swap the
//! buffer out. Compression always happens on the swapped-out batch, outside
//! any lock.
//!
//! An oversize record (bigger than the ceiling by itself) flushes whatever
//! accumulated before it and then immediately flushes alone as a one-element
//! batch; order is preserved in both steps.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

/// Record separator inside a joined batch.
pub const RECORD_SEP: u8 = 0x0A;

/// A batch swapped out of its buffer, ready for compression.
#[derive(Debug)]
pub struct BatchPayload {
    pub topic: String,
    pub records: Vec<Bytes>,
    /// Exact joined length: record bytes plus `count - 1` separators.
    pub raw_len: usize,
}

impl BatchPayload {
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Join records with a single separator between them, no trailing one.
    pub fn join(&self) -> Vec<u8> {
        let mut joined = Vec::with_capacity(self.raw_len);
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                joined.push(RECORD_SEP);
            }
            joined.extend_from_slice(record);
        }
        joined
    }
}

struct TopicBuffer {
    records: Vec<Bytes>,
    /// Sum of record lengths, separators excluded.
    record_bytes: usize,
    /// Set when the first record lands in an empty buffer.
    first_at: Instant,
}

impl TopicBuffer {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            record_bytes: 0,
            first_at: Instant::now(),
        }
    }

    fn joined_len(&self) -> usize {
        if self.records.is_empty() {
            0
        } else {
            self.record_bytes + self.records.len() - 1
        }
    }

    fn push(&mut self, record: Bytes) {
        if self.records.is_empty() {
            self.first_at = Instant::now();
        }
        self.record_bytes += record.len();
        self.records.push(record);
    }

    fn take(&mut self, topic: &str) -> BatchPayload {
        let records = mem::take(&mut self.records);
        let raw_len = if records.is_empty() {
            0
        } else {
            self.record_bytes + records.len() - 1
        };
        self.record_bytes = 0;
        BatchPayload {
            topic: topic.to_string(),
            records,
            raw_len,
        }
    }
}

/// Per-topic buffers with dual flush triggers.
pub struct TopicBatcher {
    batch_max: usize,
    batch_bytes: usize,
    buffers: Mutex<HashMap<String, Arc<Mutex<TopicBuffer>>>>,
}

impl TopicBatcher {
    pub fn new(batch_max: usize, batch_bytes: usize) -> Self {
        Self {
            batch_max,
            batch_bytes,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    fn buffer(&self, topic: &str) -> Arc<Mutex<TopicBuffer>> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TopicBuffer::new())))
            .clone()
    }

    /// Append a canonical record, returning any batches that must flush now.
    ///
    /// At most two: the pre-insert flush when the byte ceiling would be
    /// exceeded, then the post-insert flush when the buffer hits `batch_max`
    /// records or the record alone tops the ceiling.
    pub fn submit(&self, topic: &str, record: Bytes) -> Vec<BatchPayload> {
        let buffer = self.buffer(topic);
        let mut buf = buffer.lock().unwrap();
        let mut flushed = Vec::new();

        if !buf.records.is_empty() && buf.joined_len() + 1 + record.len() > self.batch_bytes {
            trace!(topic, "byte ceiling reached, flushing before insert");
            flushed.push(buf.take(topic));
        }

        buf.push(record);

        if buf.records.len() >= self.batch_max || buf.joined_len() > self.batch_bytes {
            flushed.push(buf.take(topic));
        }
        flushed
    }

    /// Swap out one topic's buffer regardless of age or size; no-op when
    /// the buffer is empty or the topic has never been seen.
    pub fn flush_topic(&self, topic: &str) -> Option<BatchPayload> {
        let handle = {
            let buffers = self.buffers.lock().unwrap();
            buffers.get(topic)?.clone()
        };
        let mut buf = handle.lock().unwrap();
        if buf.records.is_empty() {
            return None;
        }
        Some(buf.take(topic))
    }

    /// Swap out every non-empty buffer whose age reached `max_age`.
    ///
    /// Called from the flush ticker at a cadence of `batch_ms / 4`.
    pub fn take_aged(&self, max_age: Duration) -> Vec<BatchPayload> {
        let handles: Vec<(String, Arc<Mutex<TopicBuffer>>)> = {
            let buffers = self.buffers.lock().unwrap();
            buffers
                .iter()
                .map(|(topic, buf)| (topic.clone(), buf.clone()))
                .collect()
        };

        let mut aged = Vec::new();
        for (topic, handle) in handles {
            let mut buf = handle.lock().unwrap();
            if !buf.records.is_empty() && buf.first_at.elapsed() >= max_age {
                aged.push(buf.take(&topic));
            }
        }
        aged
    }

    /// Swap out every non-empty buffer regardless of age (shutdown path).
    pub fn drain_all(&self) -> Vec<BatchPayload> {
        let handles: Vec<(String, Arc<Mutex<TopicBuffer>>)> = {
            let buffers = self.buffers.lock().unwrap();
            buffers
                .iter()
                .map(|(topic, buf)| (topic.clone(), buf.clone()))
                .collect()
        };

        let mut all = Vec::new();
        for (topic, handle) in handles {
            let mut buf = handle.lock().unwrap();
            if !buf.records.is_empty() {
                all.push(buf.take(&topic));
            }
        }
        all
    }

    /// (topic_count, buffered_records, buffered_bytes) for monitoring.
    pub fn stats(&self) -> (usize, usize, usize) {
        let buffers = self.buffers.lock().unwrap();
        let mut records = 0;
        let mut bytes = 0;
        for handle in buffers.values() {
            let buf = handle.lock().unwrap();
            records += buf.records.len();
            bytes += buf.record_bytes;
        }
        (buffers.len(), records, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    // ---------------------------------------------------------------
    // Size trigger
    // ---------------------------------------------------------------

    #[test]
    fn test_flush_at_batch_max() {
        let batcher = TopicBatcher::new(3, 1024 * 1024);
        assert!(batcher.submit("t", rec("a")).is_empty());
        assert!(batcher.submit("t", rec("b")).is_empty());
        let flushed = batcher.submit("t", rec("c"));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].count(), 3);
    }

    #[test]
    fn test_exactly_batch_max_yields_one_batch() {
        let batcher = TopicBatcher::new(100, 1024 * 1024);
        let mut batches = Vec::new();
        for i in 0..100 {
            batches.extend(batcher.submit("t", rec(&format!("r{}", i))));
        }
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].count(), 100);
        let (_, buffered, _) = batcher.stats();
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_101_records_yield_100_then_1() {
        let batcher = TopicBatcher::new(100, 1024 * 1024);
        let mut batches = Vec::new();
        for i in 0..101 {
            batches.extend(batcher.submit("t", rec(&format!("r{}", i))));
        }
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].count(), 100);
        // The 101st record is still buffered, awaiting the timer.
        let remaining = batcher.drain_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].count(), 1);
        assert_eq!(remaining[0].records[0], rec("r100"));
    }

    // ---------------------------------------------------------------
    // Byte ceiling
    // ---------------------------------------------------------------

    #[test]
    fn test_flush_before_insert_on_byte_ceiling() {
        // Ceiling of 10 joined bytes; three 4-byte records.
        let batcher = TopicBatcher::new(100, 10);
        assert!(batcher.submit("t", rec("aaaa")).is_empty());
        assert!(batcher.submit("t", rec("bbbb")).is_empty()); // joined = 9
        let flushed = batcher.submit("t", rec("cccc")); // 9 + 1 + 4 > 10
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].count(), 2);
        assert_eq!(flushed[0].raw_len, 9);
        // "cccc" stays buffered.
        let rest = batcher.drain_all();
        assert_eq!(rest[0].records[0], rec("cccc"));
    }

    #[test]
    fn test_oversize_record_flushes_prior_then_itself() {
        let batcher = TopicBatcher::new(100, 10);
        assert!(batcher.submit("t", rec("abc")).is_empty());
        let flushed = batcher.submit("t", rec("0123456789AB")); // 12 bytes > ceiling
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].count(), 1);
        assert_eq!(flushed[0].records[0], rec("abc"));
        assert_eq!(flushed[1].count(), 1);
        assert_eq!(flushed[1].records[0], rec("0123456789AB"));
        let (_, buffered, _) = batcher.stats();
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_oversize_first_record_is_single_flush() {
        let batcher = TopicBatcher::new(100, 10);
        let flushed = batcher.submit("t", rec("0123456789ABCDEF"));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].count(), 1);
    }

    // ---------------------------------------------------------------
    // raw_len and join
    // ---------------------------------------------------------------

    #[test]
    fn test_raw_len_counts_separators() {
        let batcher = TopicBatcher::new(3, 1024);
        batcher.submit("t", rec("ab"));
        batcher.submit("t", rec("cde"));
        let flushed = batcher.submit("t", rec("f"));
        // 2 + 3 + 1 record bytes + 2 separators
        assert_eq!(flushed[0].raw_len, 8);
        assert_eq!(flushed[0].join(), b"ab\ncde\nf".to_vec());
    }

    #[test]
    fn test_join_single_record_has_no_separator() {
        let payload = BatchPayload {
            topic: "t".into(),
            records: vec![rec("only")],
            raw_len: 4,
        };
        assert_eq!(payload.join(), b"only".to_vec());
    }

    #[test]
    fn test_join_matches_raw_len() {
        let batcher = TopicBatcher::new(5, 1024);
        for s in ["aa", "b", "cccc", "dd"] {
            batcher.submit("t", rec(s));
        }
        let flushed = batcher.submit("t", rec("e"));
        assert_eq!(flushed[0].join().len(), flushed[0].raw_len);
    }

    // ---------------------------------------------------------------
    // Explicit flush
    // ---------------------------------------------------------------

    #[test]
    fn test_flush_topic_takes_buffer() {
        let batcher = TopicBatcher::new(100, 1024 * 1024);
        batcher.submit("t", rec("a"));
        batcher.submit("t", rec("b"));
        let payload = batcher.flush_topic("t").unwrap();
        assert_eq!(payload.count(), 2);
        let (_, buffered, _) = batcher.stats();
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_flush_topic_empty_is_noop() {
        let batcher = TopicBatcher::new(1, 1024);
        assert!(batcher.flush_topic("never-seen").is_none());
        batcher.submit("t", rec("x")); // flushes immediately at batch_max 1
        assert!(batcher.flush_topic("t").is_none());
    }

    // ---------------------------------------------------------------
    // Age trigger
    // ---------------------------------------------------------------

    #[test]
    fn test_take_aged_respects_age() {
        let batcher = TopicBatcher::new(100, 1024 * 1024);
        batcher.submit("old", rec("x"));
        std::thread::sleep(Duration::from_millis(30));
        batcher.submit("young", rec("y"));

        let aged = batcher.take_aged(Duration::from_millis(20));
        assert_eq!(aged.len(), 1);
        assert_eq!(aged[0].topic, "old");
        // The young buffer is untouched.
        let (_, buffered, _) = batcher.stats();
        assert_eq!(buffered, 1);
    }

    #[test]
    fn test_take_aged_skips_empty_buffers() {
        let batcher = TopicBatcher::new(1, 1024);
        // Submitting with batch_max = 1 flushes immediately, leaving the
        // buffer empty but present in the map.
        batcher.submit("t", rec("x"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(batcher.take_aged(Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn test_age_resets_after_flush() {
        let batcher = TopicBatcher::new(100, 1024);
        batcher.submit("t", rec("first"));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(batcher.take_aged(Duration::from_millis(20)).len(), 1);
        batcher.submit("t", rec("second"));
        // Fresh buffer: not yet aged.
        assert!(batcher.take_aged(Duration::from_millis(20)).is_empty());
    }

    // ---------------------------------------------------------------
    // Ordering and isolation
    // ---------------------------------------------------------------

    #[test]
    fn test_order_preserved_within_topic() {
        let batcher = TopicBatcher::new(4, 1024 * 1024);
        let mut flushed = Vec::new();
        for i in 0..8 {
            flushed.extend(batcher.submit("t", rec(&i.to_string())));
        }
        let all: Vec<Bytes> = flushed.into_iter().flat_map(|b| b.records).collect();
        let expected: Vec<Bytes> = (0..8).map(|i| rec(&i.to_string())).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_topics_do_not_mix() {
        let batcher = TopicBatcher::new(2, 1024);
        batcher.submit("a", rec("a1"));
        batcher.submit("b", rec("b1"));
        let fa = batcher.submit("a", rec("a2"));
        let fb = batcher.submit("b", rec("b2"));
        assert_eq!(fa[0].topic, "a");
        assert_eq!(fb[0].topic, "b");
        assert_eq!(fa[0].join(), b"a1\na2".to_vec());
        assert_eq!(fb[0].join(), b"b1\nb2".to_vec());
    }

    #[test]
    fn test_drain_all_empties_everything() {
        let batcher = TopicBatcher::new(100, 1024 * 1024);
        batcher.submit("a", rec("1"));
        batcher.submit("b", rec("2"));
        batcher.submit("c", rec("3"));
        let drained = batcher.drain_all();
        assert_eq!(drained.len(), 3);
        let (_, buffered, _) = batcher.stats();
        assert_eq!(buffered, 0);
    }

    #[test]
    fn test_concurrent_submissions_lose_nothing() {
        let batcher = Arc::new(TopicBatcher::new(10, 1024 * 1024));
        let mut handles = Vec::new();
        for t in 0..4 {
            let batcher = batcher.clone();
            handles.push(std::thread::spawn(move || {
                let topic = format!("topic{}", t);
                let mut count = 0;
                for i in 0..250 {
                    for b in batcher.submit(&topic, Bytes::from(format!("{}", i))) {
                        count += b.count();
                    }
                }
                count
            }));
        }
        let mut total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        total += batcher.drain_all().iter().map(|b| b.count()).sum::<usize>();
        assert_eq!(total, 1000);
    }
}
