//! Circuit breaker for ledger calls
//!
//! One shared breaker guards all traffic through a gateway. Failures are
//! time-stamped and counted over a rolling window; once the threshold is
//! reached within the window the circuit opens and calls fail immediately
//! without any network I/O. After the reset timeout exactly one trial call
//! is allowed through: success closes the circuit, failure re-opens it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast, no I/O attempted
    Open,
    /// One trial call in flight
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

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted
    pub failure_window: Duration,
    /// Time the circuit stays open before allowing the half-open trial
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Counters observable without taking the state lock
#[derive(Debug, Default)]
pub struct BreakerStats {
    /// Calls rejected while open (or while a trial was already in flight)
    pub rejected: AtomicU64,
    /// Times the circuit transitioned to open
    pub times_opened: AtomicU64,
    /// Times the circuit transitioned back to closed
    pub times_closed: AtomicU64,
}

struct Inner {
    state: BreakerState,
    /// Timestamps of recent failures, pruned to the rolling window
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Shared circuit breaker; state transitions are atomic with respect to
/// concurrent callers.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
            }),
            stats: BreakerStats::default(),
        }
    }

    /// Ask permission to place a call.
    ///
    /// Returns false without any I/O when the circuit is open, or when the
    /// single half-open trial slot is taken. A true return in half-open
    /// claims the trial slot; the caller must report the outcome via
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    tracing::info!(circuit = %self.name, "circuit breaker half-open, allowing trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                self.prune(&mut inner);
            }
            BreakerState::HalfOpen => {
                tracing::info!(circuit = %self.name, "trial call succeeded, closing circuit");
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                self.stats.times_closed.fetch_add(1, Ordering::Relaxed);
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => {
                self.prune(&mut inner);
                inner.failures.push_back(Instant::now());
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(circuit = %self.name, "trial call failed, re-opening circuit");
                self.open(&mut inner);
            }
            BreakerState::Open => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        let inner = self.inner.lock().await;
        inner.state
    }

    pub fn stats(&self) -> &BreakerStats {
        &self.stats
    }

    fn prune(&self, inner: &mut Inner) {
        let cutoff = self.config.failure_window;
        while let Some(front) = inner.failures.front() {
            if front.elapsed() > cutoff {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        tracing::warn!(
            circuit = %self.name,
            failures = inner.failures.len(),
            reset_timeout_ms = self.config.reset_timeout.as_millis(),
            "circuit breaker opened"
        );
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.failures.clear();
        inner.trial_in_flight = false;
        self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout(reset),
        )
    }

    #[tokio::test]
    async fn closed_allows_calls() {
        let cb = breaker(3, Duration::from_secs(30));
        assert_eq!(cb.state().await, BreakerState::Closed);
        assert!(cb.try_acquire().await);
    }

    #[tokio::test]
    async fn opens_at_threshold() {
        let cb = breaker(3, Duration::from_secs(30));

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, BreakerState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, BreakerState::Open);
        assert!(!cb.try_acquire().await);
        assert_eq!(cb.stats().rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn half_open_allows_exactly_one_trial() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure().await;
        assert_eq!(cb.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cb.try_acquire().await);
        assert_eq!(cb.state().await, BreakerState::HalfOpen);
        // Second caller is rejected while the trial is in flight
        assert!(!cb.try_acquire().await);
    }

    #[tokio::test]
    async fn trial_success_closes() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cb.try_acquire().await);
        cb.record_success().await;
        assert_eq!(cb.state().await, BreakerState::Closed);
        assert!(cb.try_acquire().await);
        assert_eq!(cb.stats().times_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn trial_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cb.try_acquire().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, BreakerState::Open);
        assert!(!cb.try_acquire().await);
        assert_eq!(cb.stats().times_opened.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn stale_failures_fall_out_of_window() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_failure_window(Duration::from_millis(30)),
        );

        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.record_failure().await;

        // First failure expired before the second landed
        assert_eq!(cb.state().await, BreakerState::Closed);
    }
}
