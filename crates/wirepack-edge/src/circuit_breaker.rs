//! Circuit Breaker for the Shipper
//!
//! Stops futile socket I/O while the collector is down. Three states:
//!
//! ```text
//! ┌────────┐  failures >= threshold  ┌──────┐
//! │ Closed │ ─────────────────────> │ Open │
//! └───┬────┘                         └───┬──┘
//!     │                                  │
//!     │ success                          │ open window expired
//!     │                                  │
//!     │      ┌──────────┐                │
//!     └───── │ HalfOpen │ <──────────────┘
//!            └─────┬────┘
//!                  │
//!                  │ consecutive successes >= threshold
//!                  └──────> Back to Closed
//! ```
//!
//! State checks are atomic loads; only the single shipper worker reports
//! outcomes, so transitions never race. Timing uses a monotonic clock
//! anchored at breaker creation.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Circuit state, observable for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, sends pass through.
    Closed = 0,
    /// Failing fast, no I/O attempted.
    Open = 1,
    /// One probe at a time is testing recovery.
    HalfOpen = 2,
}

impl CircuitState {
    /// Lowercase name used in logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Probe successes in half-open required to close.
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub open_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_window: Duration::from_secs(30),
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    /// Consecutive failures while Closed.
    failure_count: AtomicU64,
    /// Consecutive probe successes while HalfOpen.
    success_count: AtomicU64,
    /// Milliseconds since `epoch` when the circuit opened.
    opened_at_ms: AtomicU64,
    epoch: Instant,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Whether a send may proceed. In Open, flips to HalfOpen once the open
    /// window has elapsed and lets that caller probe.
    pub fn allow_request(&self) -> bool {
        match self.current_state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                if self.now_ms().saturating_sub(opened_at)
                    >= self.config.open_window.as_millis() as u64
                {
                    self.transition(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Milliseconds until a probe will be allowed; zero outside Open.
    pub fn open_remaining(&self) -> Duration {
        if self.current_state() != CircuitState::Open {
            return Duration::ZERO;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let window = self.config.open_window.as_millis() as u64;
        Duration::from_millis(window.saturating_sub(self.now_ms().saturating_sub(opened_at)))
    }

    pub fn report_success(&self) {
        match self.current_state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= u64::from(self.config.success_threshold) {
                    self.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn report_failure(&self) {
        match self.current_state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= u64::from(self.config.failure_threshold) {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, to: CircuitState) {
        self.state.store(to as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        if to == CircuitState::Open {
            self.opened_at_ms.store(self.now_ms(), Ordering::Release);
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Force the circuit closed (operator action).
    pub fn reset(&self) {
        self.transition(CircuitState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, window_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            open_window: Duration::from_millis(window_ms),
        })
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new(BreakerConfig::default());
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.open_window, Duration::from_secs(30));
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = breaker(3, 2, 1000);
        cb.report_failure();
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_open_rejects_until_window_expires() {
        let cb = breaker(1, 2, 10_000);
        cb.report_failure();
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());
        assert!(cb.open_remaining() > Duration::ZERO);
    }

    #[test]
    fn test_half_open_after_window() {
        let cb = breaker(1, 2, 30);
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.allow_request());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let cb = breaker(1, 2, 30);
        cb.report_failure();
        std::thread::sleep(Duration::from_millis(40));
        cb.allow_request();

        cb.report_success();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);
        cb.report_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = breaker(1, 2, 30);
        cb.report_failure();
        std::thread::sleep(Duration::from_millis(40));
        cb.allow_request();
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 2, 1000);
        cb.report_failure();
        cb.report_failure();
        assert_eq!(cb.failure_count(), 2);
        cb.report_success();
        assert_eq!(cb.failure_count(), 0);
        // Needs a fresh run of three failures to open.
        cb.report_failure();
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[test]
    fn test_open_ignores_extra_reports() {
        let cb = breaker(1, 1, 10_000);
        cb.report_failure();
        cb.report_failure();
        cb.report_success();
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[test]
    fn test_full_lifecycle() {
        let cb = breaker(2, 2, 30);
        assert!(cb.allow_request());

        cb.report_failure();
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.allow_request());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        cb.report_success();
        cb.report_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_manual_reset() {
        let cb = breaker(1, 2, 60_000);
        cb.report_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::Closed.name(), "closed");
        assert_eq!(CircuitState::Open.name(), "open");
        assert_eq!(CircuitState::HalfOpen.name(), "half_open");
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(CircuitState::from(0u8), CircuitState::Closed);
        assert_eq!(CircuitState::from(1u8), CircuitState::Open);
        assert_eq!(CircuitState::from(2u8), CircuitState::HalfOpen);
        assert_eq!(CircuitState::from(99u8), CircuitState::Closed);
    }
}
