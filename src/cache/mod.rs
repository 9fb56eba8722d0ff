//! Response caching: short-TTL memoization of idempotent reads.
//!
//! Three pieces cooperate, all driven by [`CacheMiddleware`](crate::middleware::CacheMiddleware):
//!
//! - [`CacheKey`]: a SHA-256 fingerprint of method, path, canonical query and
//!   an optional identity token, plus the unhashed tag used for invalidation.
//! - [`TtlPolicy`]: longest-prefix rules mapping request paths to lifetimes.
//! - [`ResponseCache`]: the bounded, mutex-guarded entry map with LRU
//!   eviction, pattern invalidation and hit/miss accounting.
//!
//! This is not an HTTP-compliant cache: `Cache-Control`, `ETag` and
//! conditional requests are ignored. Entries live in memory only.

pub mod fingerprint;
pub mod policy;
pub mod store;

pub use fingerprint::{CacheKey, Fingerprint};
pub use policy::{TtlPolicy, TtlRule};
pub use store::{CacheError, CacheStats, CachedResponse, ResponseCache};
