//! Circuit breaker guarding the L2 cache client.
//!
//! State machine:
//!
//! ```text
//! Closed ──(threshold failures within window)──► Open
//!   ▲                                             │
//!   └────(probe succeeds)──── HalfOpen ◄──(cool-down elapsed)──┘
//!                                │
//!                                └──(probe fails)──► Open
//! ```
//!
//! While Open, calls fail fast instead of stacking timeouts on a dead
//! backend. One probe decides the HalfOpen transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures within `failure_window` before the circuit opens.
    pub failure_threshold: u32,
    /// Window over which consecutive failures are counted; the count resets
    /// once the window has passed without a failure.
    pub failure_window: Duration,
    /// How long the circuit stays Open before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    first_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker with a trip counter for protection stats.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                first_failure: None,
                opened_at: None,
            }),
            config,
            trips: AtomicU64::new(0),
        }
    }

    /// Whether a call may be attempted. Transitions Open → HalfOpen once the
    /// cool-down has elapsed; the returned `true` is then the single probe.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = %self.name, "cool-down elapsed, probing");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit from HalfOpen and clears
    /// the failure window when Closed.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "probe succeeded, closing circuit");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.first_failure = None;
        inner.opened_at = None;
    }

    /// Record a failed call. A probe failure reopens immediately; in Closed
    /// the windowed consecutive-failure count decides.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening circuit");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                self.trips.fetch_add(1, Ordering::Relaxed);
            }
            BreakerState::Closed => {
                let window_expired = inner
                    .first_failure
                    .map(|at| at.elapsed() > self.config.failure_window)
                    .unwrap_or(true);
                if window_expired {
                    inner.failure_count = 0;
                    inner.first_failure = Some(now);
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "failure threshold reached, opening circuit"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    self.trips.fetch_add(1, Ordering::Relaxed);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    /// How many times the circuit has transitioned to Open.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("l2", fast_config());
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_allowed());
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn test_success_resets_failure_window() {
        let breaker = CircuitBreaker::new("l2", fast_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_decides() {
        let breaker = CircuitBreaker::new("l2", fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.is_allowed(), "probe allowed after cool-down");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Failed probe reopens and counts a second trip.
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.trips(), 2);

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.is_allowed());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.is_allowed());
    }
}
