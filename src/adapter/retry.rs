use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter:
/// `delay(i) = min(initial * multiplier^i, max) + random(0, jitter * delay)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(16),
            multiplier: 2.0,
            jitter: 0.1,
            max_retries: 4,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting, for tests and impatient callers.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
            multiplier: 1.0,
            max_retries,
        }
    }

    /// Backoff before retry attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped + rand::rng().random_range(0.0..=(self.jitter * capped).max(f64::EPSILON))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}
