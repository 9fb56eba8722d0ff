//! Telemetry metric name constants.
//!
//! Hosts install their own `metrics` recorder (prometheus, statsd, …);
//! without one every metric call is a no-op. The in-process
//! [`LatencyRecorder`](crate::latency::LatencyRecorder) and
//! [`ResponseCache::stats`](crate::cache::ResponseCache::stats) work either way.
//!
//! All metrics are prefixed with `tollgate_`. Counters end in `_total`,
//! histograms carry their unit.

/// Cache lookups answered from memory.
pub const CACHE_HITS_TOTAL: &str = "tollgate_cache_hits_total";

/// Cache lookups that fell through to the origin (absent or stale).
pub const CACHE_MISSES_TOTAL: &str = "tollgate_cache_misses_total";

/// Entries dropped to stay within the entry or byte budget.
pub const CACHE_EVICTIONS_TOTAL: &str = "tollgate_cache_evictions_total";

/// Requests refused by a rate limiter.
///
/// Labels: `scope` (`general` or the scoped limiter's prefix).
pub const ADMISSION_REJECTED_TOTAL: &str = "tollgate_admission_rejected_total";

/// Requests that were held back by a slow-down before proceeding.
pub const ADMISSION_DELAYED_TOTAL: &str = "tollgate_admission_delayed_total";

/// End-to-end request duration in seconds, slow-down delay included.
///
/// Labels: `cache` (`HIT` | `MISS` | `BYPASS`).
pub const REQUEST_DURATION_SECONDS: &str = "tollgate_request_duration_seconds";
