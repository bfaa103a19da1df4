//! Frame Shipper
//!
//! Owns the single logical outbound connection to the collector and a
//! byte-bounded FIFO of pending frames.
//!
//! ```text
//! enqueue(frame) ──→ ┌──────────────────────────────┐
//!                    │ pending queue (byte-bounded) │──→ worker ──→ TCP
//!                    │  overflow: drop OLDEST       │      │
//!                    └──────────────────────────────┘      │
//!                                  ▲                       │
//!                                  └── requeue at head ────┘ on write error
//! ```
//!
//! Delivery policy:
//! - each frame is written atomically (`write_all` + flush); a failed write
//!   requeues the frame at the *head* so topic order survives retries, and
//!   the connection is discarded
//! - reconnection backs off exponentially from 100 ms to 10 s with +/-25%
//!   jitter
//! - the circuit breaker gates all I/O: while open, the worker sleeps
//!   instead of touching the socket
//! - on queue overflow the oldest frames are dropped and counted in
//!   `shipper_dropped`; under sustained overload freshness beats
//!   completeness
//!
//! Shutdown drains the queue within a bounded grace window; whatever is
//! left is counted as dropped and abandoned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};

use wirepack_core::MetricsRegistry;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::connection::ConnectionProvider;

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Byte bound on the pending queue.
    pub queue_bytes: usize,
    /// First reconnect backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            queue_bytes: 64 * 1024 * 1024,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

struct PendingFrame {
    topic: String,
    bytes: Bytes,
}

#[derive(Default)]
struct Queue {
    frames: VecDeque<PendingFrame>,
    total_bytes: usize,
    /// True while the worker holds a popped frame.
    in_flight: bool,
    /// Set once the drain grace expired; in-flight failures are dropped
    /// instead of requeued.
    abandoned: bool,
}

pub struct Shipper {
    config: ShipperConfig,
    queue: Mutex<Queue>,
    notify: Notify,
    breaker: CircuitBreaker,
    provider: Arc<dyn ConnectionProvider>,
    metrics: Arc<MetricsRegistry>,
}

impl Shipper {
    pub fn new(
        config: ShipperConfig,
        breaker: CircuitBreaker,
        provider: Arc<dyn ConnectionProvider>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            breaker,
            provider,
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// (pending_frames, pending_bytes)
    pub fn pending(&self) -> (usize, usize) {
        let q = self.queue.lock().unwrap();
        (q.frames.len(), q.total_bytes)
    }

    /// Queue a frame for delivery. Never blocks; overflow evicts the oldest
    /// frames (the newly queued frame always survives).
    pub fn enqueue(&self, topic: &str, frame: Bytes) {
        let mut dropped = 0u64;
        {
            let mut q = self.queue.lock().unwrap();
            q.total_bytes += frame.len();
            q.frames.push_back(PendingFrame {
                topic: topic.to_string(),
                bytes: frame,
            });
            while q.total_bytes > self.config.queue_bytes && q.frames.len() > 1 {
                let evicted = q.frames.pop_front().expect("len > 1");
                q.total_bytes -= evicted.bytes.len();
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
            warn!(dropped, "pending queue overflow, oldest frames dropped");
        }
        self.notify.notify_one();
    }

    /// Deliver frames until shutdown is signaled and the queue is empty.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut conn: Option<TcpStream> = None;
        let mut attempt: u32 = 0;
        debug!("shipper worker started");

        loop {
            let frame = {
                let mut q = self.queue.lock().unwrap();
                match q.frames.pop_front() {
                    Some(frame) => {
                        q.total_bytes -= frame.bytes.len();
                        q.in_flight = true;
                        Some(frame)
                    }
                    None => None,
                }
            };

            let Some(frame) = frame else {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            // Fail fast while the breaker is open.
            if !self.gate() {
                self.requeue_front(frame);
                let wait = self
                    .breaker
                    .open_remaining()
                    .clamp(Duration::from_millis(10), Duration::from_millis(250));
                self.sleep_or_wake(wait, &mut shutdown).await;
                continue;
            }

            if conn.is_none() {
                conn = self.provider.acquire().await;
            }
            let Some(mut stream) = conn.take() else {
                self.on_send_failure(frame);
                attempt += 1;
                let backoff = self.backoff_with_jitter(attempt);
                self.sleep_or_wake(backoff, &mut shutdown).await;
                continue;
            };

            let sent = send_frame(&mut stream, &frame.bytes).await;
            match sent {
                Ok(()) => {
                    trace!(topic = %frame.topic, bytes = frame.bytes.len(), "frame shipped");
                    self.report_breaker(|b| b.report_success());
                    attempt = 0;
                    self.queue.lock().unwrap().in_flight = false;
                    conn = Some(stream);
                }
                Err(e) => {
                    warn!(topic = %frame.topic, error = %e, "send failed, discarding connection");
                    self.provider.release(stream, false).await;
                    self.on_send_failure(frame);
                    attempt += 1;
                    let backoff = self.backoff_with_jitter(attempt);
                    self.sleep_or_wake(backoff, &mut shutdown).await;
                }
            }
        }

        if let Some(stream) = conn {
            self.provider.release(stream, true).await;
        }
        debug!("shipper worker stopped");
    }

    /// Wait for the queue to empty, up to `grace`; leftovers are counted in
    /// `shipper_dropped` and abandoned.
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            {
                let q = self.queue.lock().unwrap();
                if q.frames.is_empty() && !q.in_flight {
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            self.notify.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let dropped = {
            let mut q = self.queue.lock().unwrap();
            q.abandoned = true;
            q.total_bytes = 0;
            let n = q.frames.len() as u64;
            q.frames.clear();
            n
        };
        if dropped > 0 {
            self.metrics.record_dropped(dropped);
            warn!(dropped, "drain grace expired, abandoning pending frames");
        }
    }

    /// Breaker gate, recording the Open -> HalfOpen transition when it fires.
    fn gate(&self) -> bool {
        let before = self.breaker.current_state();
        let allowed = self.breaker.allow_request();
        let after = self.breaker.current_state();
        if before != after {
            info!(state = after.name(), "circuit breaker transition");
            self.metrics.record_breaker_transition(after.name());
        }
        allowed
    }

    fn report_breaker(&self, f: impl FnOnce(&CircuitBreaker)) {
        let before = self.breaker.current_state();
        f(&self.breaker);
        let after = self.breaker.current_state();
        if before != after {
            if after == CircuitState::Open {
                warn!(state = after.name(), "circuit breaker transition");
            } else {
                info!(state = after.name(), "circuit breaker transition");
            }
            self.metrics.record_breaker_transition(after.name());
        }
    }

    fn on_send_failure(&self, frame: PendingFrame) {
        self.metrics.record_network_error(&frame.topic);
        self.report_breaker(|b| b.report_failure());
        self.requeue_front(frame);
    }

    /// Put a frame back at the head, preserving order ahead of newer frames.
    fn requeue_front(&self, frame: PendingFrame) {
        let mut q = self.queue.lock().unwrap();
        q.in_flight = false;
        if q.abandoned {
            drop(q);
            self.metrics.record_dropped(1);
            return;
        }
        q.total_bytes += frame.bytes.len();
        q.frames.push_front(frame);
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base.as_millis() as f64
            * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let capped = exp.min(self.config.backoff_cap.as_millis() as f64);
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((capped * jitter) as u64)
    }

    /// Sleep, waking early on shutdown or new work. During shutdown the wait
    /// is clamped short so drain does not stall behind a long backoff.
    async fn sleep_or_wake(&self, wait: Duration, shutdown: &mut watch::Receiver<bool>) {
        let wait = if *shutdown.borrow() {
            wait.min(Duration::from_millis(50))
        } else {
            wait
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// One frame, written atomically: all bytes plus a flush, or an error.
async fn send_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}
