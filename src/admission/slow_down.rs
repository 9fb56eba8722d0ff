//! Progressive throttling: delay instead of reject.

use std::time::Duration;

use tokio::time::Instant;

use super::window::FixedWindows;

/// Injects a growing delay once a client passes `delay_after` requests in a window.
///
/// The delay for the n-th request is
/// `min(max_delay, (n - delay_after) * delay_per_request)` and zero while
/// `n <= delay_after`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::admission::SlowDown;
///
/// let slow = SlowDown::new(Duration::from_secs(60), 2, Duration::from_millis(100), Duration::from_millis(250));
/// assert_eq!(slow.delay_for_count(2), Duration::ZERO);
/// assert_eq!(slow.delay_for_count(3), Duration::from_millis(100));
/// assert_eq!(slow.delay_for_count(4), Duration::from_millis(200));
/// assert_eq!(slow.delay_for_count(9), Duration::from_millis(250));
/// ```
pub struct SlowDown {
    windows: FixedWindows,
    delay_after: u64,
    delay_per_request: Duration,
    max_delay: Duration,
}

impl SlowDown {
    pub fn new(
        window: Duration,
        delay_after: u64,
        delay_per_request: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            windows: FixedWindows::new(window),
            delay_after,
            delay_per_request,
            max_delay,
        }
    }

    /// Counts a request from `identity` and returns how long it must wait.
    pub fn delay_for(&self, identity: &str, now: Instant) -> Duration {
        let hit = self.windows.hit(identity, now);
        self.delay_for_count(hit.count)
    }

    /// The delay owed by the `count`-th request of a window.
    pub fn delay_for_count(&self, count: u64) -> Duration {
        let excess = count.saturating_sub(self.delay_after);
        if excess == 0 {
            return Duration::ZERO;
        }
        let excess = u32::try_from(excess).unwrap_or(u32::MAX);
        self.delay_per_request
            .saturating_mul(excess)
            .min(self.max_delay)
    }

    pub fn delay_after(&self) -> u64 {
        self.delay_after
    }

    pub(crate) fn purge_expired(&self, now: Instant) -> usize {
        self.windows.purge_expired(now)
    }
}
