//! Collector Connections
//!
//! The shipper depends only on the [`ConnectionProvider`] contract: acquire
//! a warm socket if one is available, hand it back with a health verdict.
//! [`TcpPool`] is the default implementation, keeping a small stack of idle
//! connections so successive frames reuse one TCP session instead of paying
//! a handshake per batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Contract between the shipper and whatever supplies sockets.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// A connected socket, or `None` when one cannot be produced right now.
    async fn acquire(&self) -> Option<TcpStream>;

    /// Return a socket after use. Unhealthy sockets are discarded.
    async fn release(&self, conn: TcpStream, healthy: bool);
}

/// Idle-reusing TCP connection pool.
pub struct TcpPool {
    addr: String,
    max_idle: usize,
    max_idle_age: Duration,
    connect_timeout: Duration,
    idle: Mutex<Vec<(TcpStream, Instant)>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl TcpPool {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_idle: 2,
            max_idle_age: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            idle: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// (connections_created, connections_reused) for monitoring.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.created.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }

    async fn connect(&self) -> Option<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(error = %e, "set_nodelay failed");
                }
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(addr = %self.addr, "connected to collector");
                Some(stream)
            }
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "connect failed");
                None
            }
            Err(_) => {
                warn!(addr = %self.addr, timeout_ms = self.connect_timeout.as_millis() as u64, "connect timed out");
                None
            }
        }
    }
}

#[async_trait]
impl ConnectionProvider for TcpPool {
    async fn acquire(&self) -> Option<TcpStream> {
        {
            let mut idle = self.idle.lock().await;
            while let Some((conn, parked_at)) = idle.pop() {
                if parked_at.elapsed() < self.max_idle_age {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    trace!(addr = %self.addr, "reusing idle connection");
                    return Some(conn);
                }
                // Stale; drop it and look at the next one.
            }
        }
        self.connect().await
    }

    async fn release(&self, conn: TcpStream, healthy: bool) {
        if !healthy {
            debug!(addr = %self.addr, "discarding unhealthy connection");
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push((conn, Instant::now()));
        }
        // At capacity the socket just drops.
    }
}
