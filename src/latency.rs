//! Per-route latency sampling and percentile snapshots.
//!
//! Each route key (`"METHOD /path"`) owns a ring buffer of its most recent
//! durations. Percentiles are computed on demand by sorting a copy of the
//! buffer and indexing at `floor(len * p)`, clamped to the last element.
//! That estimator is biased for small samples.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Default number of samples retained per route.
pub const DEFAULT_SAMPLE_CAPACITY: usize = 100;

/// Default number of distinct route keys tracked.
pub const DEFAULT_MAX_ROUTES: usize = 1_000;

/// Route key that absorbs samples once `max_routes` keys exist.
pub const OVERFLOW_ROUTE: &str = "OTHER";

/// Summary statistics for one route, in milliseconds.
///
/// `count` and the percentiles describe the retained window; `total` and
/// `errors` count every request since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub total: u64,
    /// Requests that ended in a 5xx or were abandoned before completing.
    pub errors: u64,
}

#[derive(Default)]
struct RouteSamples {
    samples: VecDeque<Duration>,
    total: u64,
    errors: u64,
}

impl RouteSamples {
    fn push(&mut self, capacity: usize, duration: Duration, failed: bool) {
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
        self.total += 1;
        if failed {
            self.errors += 1;
        }
    }

    fn snapshot(&self) -> LatencySnapshot {
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return LatencySnapshot {
                total: self.total,
                errors: self.errors,
                ..LatencySnapshot::default()
            };
        }
        sorted.sort_unstable();

        let sum: Duration = sorted.iter().sum();
        let count = sorted.len();
        LatencySnapshot {
            count,
            avg_ms: millis(sum) / count as f64,
            min_ms: millis(sorted[0]),
            max_ms: millis(sorted[count - 1]),
            p50_ms: millis(percentile(&sorted, 500)),
            p95_ms: millis(percentile(&sorted, 950)),
            p99_ms: millis(percentile(&sorted, 990)),
            total: self.total,
            errors: self.errors,
        }
    }
}

/// `sorted[floor(len * per_mille / 1000)]`, clamped to the last index.
///
/// Integer arithmetic keeps the index exact; `sorted` must be non-empty.
fn percentile(sorted: &[Duration], per_mille: usize) -> Duration {
    let index = (sorted.len() * per_mille / 1000).min(sorted.len() - 1);
    sorted[index]
}

fn millis(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

/// Bounded per-route latency buffers behind a single mutex.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::latency::LatencyRecorder;
///
/// let recorder = LatencyRecorder::new(100);
/// for ms in [10, 20, 30] {
///     recorder.record("GET /products", Duration::from_millis(ms));
/// }
/// let snap = recorder.snapshot("GET /products");
/// assert_eq!(snap.count, 3);
/// assert_eq!(snap.avg_ms, 20.0);
/// assert_eq!(snap.p50_ms, 20.0);
/// assert_eq!(recorder.snapshot("GET /unknown").count, 0);
/// ```
pub struct LatencyRecorder {
    capacity: usize,
    max_routes: usize,
    routes: Mutex<HashMap<String, RouteSamples>>,
}

impl LatencyRecorder {
    /// Creates a recorder retaining `capacity` samples per route.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_routes: DEFAULT_MAX_ROUTES,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Caps the number of distinct route keys; further keys share [`OVERFLOW_ROUTE`].
    #[must_use]
    pub fn with_max_routes(mut self, max_routes: usize) -> Self {
        self.max_routes = max_routes.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RouteSamples>> {
        self.routes.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("latency recorder lock was poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Records a completed request.
    pub fn record(&self, route_key: &str, duration: Duration) {
        self.push(route_key, duration, false);
    }

    /// Records a request that failed or was abandoned.
    pub fn record_failed(&self, route_key: &str, duration: Duration) {
        self.push(route_key, duration, true);
    }

    fn push(&self, route_key: &str, duration: Duration, failed: bool) {
        let mut routes = self.lock();
        let key = if routes.contains_key(route_key) || routes.len() < self.max_routes {
            route_key
        } else {
            OVERFLOW_ROUTE
        };
        routes
            .entry(key.to_owned())
            .or_default()
            .push(self.capacity, duration, failed);
    }

    /// Summary for one route; zeroed if the route has no samples.
    pub fn snapshot(&self, route_key: &str) -> LatencySnapshot {
        self.lock()
            .get(route_key)
            .map(RouteSamples::snapshot)
            .unwrap_or_default()
    }

    /// Summaries for every route, ordered by route key.
    pub fn all_snapshots(&self) -> BTreeMap<String, LatencySnapshot> {
        self.lock()
            .iter()
            .map(|(key, samples)| (key.clone(), samples.snapshot()))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAPACITY)
    }
}
