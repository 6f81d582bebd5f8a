/// Backoff policies consulted between retry attempts
use rand::Rng;
use std::time::Duration;

/// Decides how long to wait before the next attempt.
///
/// `attempt` is the 1-based number of the attempt that just failed. Returning
/// `None` tells the caller to stop retrying.
pub trait BackoffPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Same delay between every attempt, forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        Some(self.delay)
    }
}

/// Exponential backoff with optional ±30% jitter, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Randomize each delay by ±30%
    pub jitter: bool,
    /// Total attempts before giving up (`None` = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            max_attempts: Some(4),
        }
    }
}

impl ExponentialBackoff {
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let base = self.base_delay(attempt);
        if !self.jitter {
            return Some(base);
        }

        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Some(Duration::from_millis((base.as_millis() as f64 * factor) as u64))
    }
}
