use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request quota shared by every partition attempt of one engine.
///
/// Cloning shares the underlying budget.
#[derive(Clone)]
pub struct RequestThrottle {
    limiter: Arc<DirectRateLimiter>,
    quota_window: Duration,
    quota_limit: u32,
}

impl RequestThrottle {
    /// Allows `quota_limit` requests per `quota_window`, with the whole limit available as burst.
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        let quota = quota_from_window(quota_window, quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            quota_window,
            quota_limit: quota_limit.max(1),
        }
    }

    /// Waits until one request may be sent.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Takes one unit of budget without waiting. Returns `false` when exhausted.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn quota_window(&self) -> Duration {
        self.quota_window
    }

    pub fn quota_limit(&self) -> u32 {
        self.quota_limit
    }
}

impl std::fmt::Debug for RequestThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestThrottle")
            .field("quota_window", &self.quota_window)
            .field("quota_limit", &self.quota_limit)
            .finish()
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let burst = NonZeroU32::new(quota_limit).unwrap_or(NonZeroU32::MIN);

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(burst.get())).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(burst))
        .allow_burst(burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_burst_then_rejects() {
        let throttle = RequestThrottle::new(Duration::from_secs(60), 2);

        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
    }

    #[test]
    fn clones_share_budget() {
        let throttle = RequestThrottle::new(Duration::from_secs(60), 1);
        let clone = throttle.clone();

        assert!(throttle.try_acquire());
        assert!(!clone.try_acquire());
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let throttle = RequestThrottle::new(Duration::from_secs(60), 0);
        assert_eq!(throttle.quota_limit(), 1);
        assert!(throttle.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_replenishment() {
        let throttle = RequestThrottle::new(Duration::from_millis(20), 1);
        throttle.acquire().await;

        let started = std::time::Instant::now();
        throttle.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
