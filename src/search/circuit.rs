//! Circuit breaker guarding per-project search fan-out.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open →
//! HalfOpen once the open interval elapses; HalfOpen → Closed after
//! `recovery_threshold` successes, or straight back to Open on a failure.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_threshold: u32,
    open_interval: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_threshold: u32, open_interval: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_threshold,
            open_interval,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                consecutive_failures: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Breaker tuned for per-project search targets.
    pub fn for_project() -> Self {
        Self::new(3, 1, Duration::from_secs(30))
    }

    /// Whether a call may proceed. Transitions Open → HalfOpen when the
    /// open interval has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_interval)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::debug!("circuit breaker half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.recovery_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    tracing::debug!("circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::debug!("circuit breaker re-opened from half-open");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!("circuit breaker tripped open");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_failures() {
        let cb = CircuitBreaker::new(3, 1, Duration::from_secs(60));
        assert!(cb.allow());
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn success_resets_failure_streak() {
        let cb = CircuitBreaker::new(3, 1, Duration::from_secs(60));
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn recovers_through_half_open() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(0));
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Zero interval: next allow goes half-open immediately.
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(1, 1, Duration::from_millis(0));
        cb.on_failure();
        assert!(cb.allow());
        cb.on_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
