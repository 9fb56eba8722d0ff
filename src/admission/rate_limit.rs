//! Hard fixed-window rate limiting.

use std::time::Duration;

use tokio::time::Instant;

use super::window::FixedWindows;

/// Remaining allowance in the caller's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub resets_in: Duration,
}

impl Quota {
    /// `resets_in` in whole seconds, rounded up.
    pub fn resets_in_secs(&self) -> u64 {
        ceil_secs(self.resets_in)
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// Result of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(Quota),
    Limited { limit: u64, retry_after: Duration },
}

/// Allows at most `max_requests` per identity in each fixed window.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use tollgate::admission::{RateDecision, RateLimiter};
///
/// let limiter = RateLimiter::new(Duration::from_secs(60), 2);
/// let now = Instant::now();
/// assert!(matches!(limiter.check("10.0.0.1", now), RateDecision::Allowed(_)));
/// assert!(matches!(limiter.check("10.0.0.1", now), RateDecision::Allowed(_)));
/// assert!(matches!(limiter.check("10.0.0.1", now), RateDecision::Limited { .. }));
/// ```
pub struct RateLimiter {
    windows: FixedWindows,
    max_requests: u64,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            windows: FixedWindows::new(window),
            max_requests,
        }
    }

    /// Counts a request from `identity` and decides whether it may proceed.
    ///
    /// Rejected requests still count: a client hammering a closed window
    /// does not earn an earlier reset.
    pub fn check(&self, identity: &str, now: Instant) -> RateDecision {
        let hit = self.windows.hit(identity, now);
        if hit.count > self.max_requests {
            RateDecision::Limited {
                limit: self.max_requests,
                retry_after: hit.resets_in,
            }
        } else {
            RateDecision::Allowed(Quota {
                limit: self.max_requests,
                remaining: self.max_requests - hit.count,
                resets_in: hit.resets_in,
            })
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.windows.size()
    }

    pub(crate) fn purge_expired(&self, now: Instant) -> usize {
        self.windows.purge_expired(now)
    }
}
