use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit state: closed (normal), open (failing fast), half-open (probing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Three-state gate in front of a flaky dependency. Thresholds: N failures
/// open the circuit; after the reset timeout one probe is allowed through;
/// its outcome closes or re-opens.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().map(|i| i.state).unwrap_or(BreakerState::Open)
    }

    /// Gate a request. `Ok(())` means proceed; `Err(remaining)` means the
    /// circuit is open with that much cooldown left. An elapsed cooldown
    /// transitions open → half-open and lets one probe through.
    pub fn check(&self) -> Result<(), Duration> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(self.reset_timeout);
        };
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.reset_timeout {
                    info!("circuit breaker half-open, allowing probe");
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.reset_timeout - elapsed)
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == BreakerState::HalfOpen {
                info!("circuit breaker closed after successful probe");
            }
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            match inner.state {
                BreakerState::HalfOpen => {
                    warn!("circuit breaker re-opened: probe failed");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
                BreakerState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.failure_threshold {
                        warn!(
                            failures = inner.consecutive_failures,
                            "circuit breaker opened"
                        );
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
                BreakerState::Open => {}
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}
