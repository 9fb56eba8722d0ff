//! Fixed-window request counters keyed by client identity.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// Outcome of counting one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Requests seen in the current window, this one included.
    pub count: u64,
    /// Time until the current window closes.
    pub resets_in: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u64,
}

/// Per-identity fixed windows behind one mutex.
///
/// Checking for expiry, resetting and incrementing happen under the same
/// lock acquisition, so concurrent requests at a window boundary cannot both
/// observe a fresh window. Elapsed time is computed with
/// `saturating_duration_since`, so a clock that appears to run backwards
/// reads as zero elapsed rather than an enormous interval.
pub struct FixedWindows {
    size: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindows {
    /// Creates counters with windows of `size`. Zero is raised to one millisecond.
    pub fn new(size: Duration) -> Self {
        Self {
            size: size.max(Duration::from_millis(1)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("admission window lock was poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Counts one request from `identity` at `now`.
    pub fn hit(&self, identity: &str, now: Instant) -> WindowHit {
        let mut windows = self.lock();
        let window = windows
            .entry(identity.to_owned())
            .or_insert(Window { start: now, count: 0 });

        if now.saturating_duration_since(window.start) >= self.size {
            window.start = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);

        WindowHit {
            count: window.count,
            resets_in: self
                .size
                .saturating_sub(now.saturating_duration_since(window.start)),
        }
    }

    /// Drops windows that have already closed. Returns the number dropped.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.start) < self.size);
        before - windows.len()
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
