//! Bounded retry budget and backoff between partition attempts.

use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// No wait between attempts.
    None,
    Fixed { delay: Duration },
    /// `base * factor^retry`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        /// Upper bound before jitter is applied.
        max: Duration,
        /// Spread the capped delay uniformly over +/- 50%.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based: the wait after attempt 1 is retry 0).
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if !jitter {
                    return delay;
                }

                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let spread = millis / 2;
                let offset = fastrand::u64(0..=spread.saturating_mul(2));
                Duration::from_millis(millis.saturating_sub(spread).saturating_add(offset))
            }
        }
    }
}

/// Attempt budget for one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting.
    pub fn single_attempt() -> Self {
        Self::new(1, Backoff::None)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait after attempt number `attempt` (1-based) before the next one.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt.saturating_sub(1))
    }
}
