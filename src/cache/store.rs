//! The in-memory response store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CacheKey, Fingerprint};
use crate::http::{Response, StatusCode, path_has_prefix};
use crate::telemetry;

/// Default maximum number of cached responses.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Reasons a response cannot become a cache entry.
///
/// These never reach the client: the middleware logs them and serves the
/// live response uncached.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("status {0} is not cacheable")]
    NotCacheable(u16),

    #[error("payload of {size} bytes exceeds the {max}-byte entry limit")]
    TooLarge { size: usize, max: usize },
}

/// The replayable part of a response: status, content type and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    status: StatusCode,
    content_type: Option<String>,
    body: Bytes,
}

impl CachedResponse {
    /// Captures `response` for caching.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotCacheable`]: the status is not 2xx.
    /// - [`CacheError::TooLarge`]: the body exceeds `max_bytes`.
    pub fn from_response(response: &Response, max_bytes: usize) -> Result<Self, CacheError> {
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::NotCacheable(status.as_u16()));
        }
        let size = response.body_ref().len();
        if size > max_bytes {
            return Err(CacheError::TooLarge {
                size,
                max: max_bytes,
            });
        }
        Ok(Self {
            status,
            content_type: response.content_type().map(str::to_owned),
            body: response.body_ref().clone(),
        })
    }

    /// Rebuilds a response identical in content to the one captured.
    pub fn to_response(&self) -> Response {
        let response = Response::new(self.status).body_bytes(self.body.clone());
        match &self.content_type {
            Some(ct) => response.header("Content-Type", ct.as_str()),
            None => response,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Approximate memory charged against the byte budget.
    pub fn weight(&self) -> usize {
        self.body.len() + self.content_type.as_ref().map_or(0, String::len)
    }
}

/// A point-in-time view of cache occupancy and effectiveness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// `hits / (hits + misses)` since startup; `0.0` before the first lookup.
    pub hit_rate: f64,
}

struct Entry {
    path: String,
    tag: String,
    payload: CachedResponse,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

struct Inner {
    // Unbounded; `ResponseCache::put` enforces both budgets.
    entries: LruCache<Fingerprint, Entry>,
    bytes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Entry> {
        let entry = self.entries.pop(fingerprint)?;
        self.bytes -= entry.payload.weight();
        Some(entry)
    }

    fn remove_where(&mut self, mut doomed: impl FnMut(&Fingerprint, &Entry) -> bool) -> usize {
        let victims: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(fp, entry)| doomed(fp, entry))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &victims {
            self.remove(fp);
        }
        victims.len()
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, entry)) => {
                self.bytes -= entry.payload.weight();
                true
            }
            None => false,
        }
    }
}

/// Bounded map from [`Fingerprint`] to [`CachedResponse`].
///
/// A single mutex guards the entry map; every operation is O(1) or O(n) in
/// the number of entries and never awaits while holding it. When the entry
/// count or byte budget is exceeded the least recently used entries are
/// evicted. Stale entries are never returned and are dropped either when
/// read, when overwritten, or by [`purge_expired`](Self::purge_expired).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::cache::{CacheKey, CachedResponse, ResponseCache};
/// use tollgate::http::{Method, Response, StatusCode};
/// use tollgate::Request;
///
/// let cache = ResponseCache::new(100);
/// let key = CacheKey::for_request(&Request::new(Method::Get, "/products"), None);
/// let payload = CachedResponse::from_response(&Response::new(StatusCode::Ok).body("[]"), 1024).unwrap();
///
/// cache.put(&key, payload.clone(), Duration::from_secs(30));
/// assert_eq!(cache.get(key.fingerprint()), Some(payload));
/// assert_eq!(cache.invalidate("/products"), 1);
/// assert!(cache.get(key.fingerprint()).is_none());
/// ```
pub struct ResponseCache {
    inner: Mutex<Inner>,
    max_entries: usize,
    max_bytes: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Creates an empty cache holding at most `max_entries` responses.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            max_entries: max_entries.max(1),
            max_bytes: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Additionally bounds the summed payload size.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("response cache lock was poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }

    /// Returns the cached payload if a fresh entry exists.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CachedResponse> {
        let now = Instant::now();
        let found = {
            let mut inner = self.lock();
            // `peek` leaves recency alone; only a fresh hit is promoted.
            match inner.entries.peek(fingerprint).map(|entry| entry.is_fresh(now)) {
                Some(true) => inner.entries.get(fingerprint).map(|entry| entry.payload.clone()),
                Some(false) => {
                    inner.remove(fingerprint);
                    None
                }
                None => None,
            }
        };

        match found {
            Some(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                Some(payload)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Inserts or overwrites the entry for `key`.
    ///
    /// Never fails: a zero TTL or a payload larger than the whole byte budget
    /// is silently not stored.
    pub fn put(&self, key: &CacheKey, payload: CachedResponse, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let weight = payload.weight();
        if self.max_bytes.is_some_and(|max| weight > max) {
            debug!(tag = key.tag(), weight, "payload exceeds byte budget, not cached");
            return;
        }

        let mut evicted = 0u64;
        {
            let mut inner = self.lock();
            inner.remove(key.fingerprint());

            inner.bytes += weight;
            inner.entries.put(
                key.fingerprint().clone(),
                Entry {
                    path: key.path().to_owned(),
                    tag: key.tag().to_owned(),
                    payload,
                    stored_at: Instant::now(),
                    ttl,
                },
            );

            while inner.entries.len() > self.max_entries
                || self.max_bytes.is_some_and(|max| inner.bytes > max)
            {
                if !inner.evict_lru() {
                    break;
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(evicted);
            debug!(evicted, "evicted least recently used entries");
        }
    }

    /// Removes every entry whose tag or fingerprint matches `pattern`.
    ///
    /// A pattern without `*` matches as a substring; `*` matches any run of
    /// characters. Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let removed = self.lock().remove_where(|fp, entry| {
            wildcard_contains(&entry.tag, pattern) || wildcard_contains(fp.as_str(), pattern)
        });
        info!(pattern, removed, "cache invalidated");
        removed
    }

    /// Removes every entry whose path lies under `prefix` (segment-aware).
    pub fn invalidate_path(&self, prefix: &str) -> usize {
        let removed = self
            .lock()
            .remove_where(|_, entry| path_has_prefix(&entry.path, prefix));
        if removed > 0 {
            info!(prefix, removed, "cache invalidated by path");
        }
        removed
    }

    /// Removes all entries. Returns the number removed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.entries.len();
            inner.entries.clear();
            inner.bytes = 0;
            removed
        };
        info!(removed, "cache cleared");
        removed
    }

    /// Physically removes stale entries. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.lock().remove_where(|_, entry| !entry.is_fresh(now))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of occupancy and lifetime hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let (size, bytes) = {
            let inner = self.lock();
            (inner.entries.len(), inner.bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size,
            capacity: self.max_entries,
            bytes,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Spawns a task that calls [`purge_expired`](Self::purge_expired) every
    /// `interval`. The task exits once the cache has been dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    info!(removed, remaining = cache.len(), "reaped stale cache entries");
                }
            }
        })
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Unanchored glob match supporting only `*`.
fn wildcard_contains(haystack: &str, pattern: &str) -> bool {
    let mut rest = haystack;
    for part in pattern.split('*').filter(|p| !p.is_empty()) {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;
    use crate::http::Method;

    fn key(target: &str) -> CacheKey {
        CacheKey::for_request(&Request::new(Method::Get, target), None)
    }

    fn payload(body: &str) -> CachedResponse {
        let response = Response::new(StatusCode::Ok)
            .header("Content-Type", "application/json")
            .body(body.to_owned());
        CachedResponse::from_response(&response, usize::MAX).unwrap()
    }

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn fresh_until_ttl_then_miss() {
        let cache = ResponseCache::new(10);
        let k = key("/products?limit=10");
        cache.put(&k, payload("[1]"), TTL);

        tokio::time::advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(cache.get(k.fingerprint()), Some(payload("[1]")));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(k.fingerprint()), None);
        assert!(cache.is_empty(), "stale entry is dropped on read");
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_restarts_lifetime() {
        let cache = ResponseCache::new(10);
        let k = key("/a");
        cache.put(&k, payload("old"), TTL);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.put(&k, payload("new"), TTL);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(k.fingerprint()), Some(payload("new")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = ResponseCache::new(10);
        cache.put(&key("/a"), payload("x"), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_by_substring_and_wildcard() {
        let cache = ResponseCache::new(10);
        cache.put(&key("/products?limit=10"), payload("a"), TTL);
        cache.put(&key("/products/7"), payload("b"), TTL);
        cache.put(&key("/orders?status=open"), payload("c"), TTL);

        assert_eq!(cache.invalidate("status=*open"), 1);
        assert!(cache.get(key("/orders?status=open").fingerprint()).is_none());

        assert_eq!(cache.invalidate("GET /products"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_by_fingerprint() {
        let cache = ResponseCache::new(10);
        let k = key("/a");
        cache.put(&k, payload("a"), TTL);
        assert_eq!(cache.invalidate(k.fingerprint().as_str()), 1);
    }

    #[test]
    fn invalidate_path_is_segment_aware() {
        let cache = ResponseCache::new(10);
        cache.put(&key("/products?limit=1"), payload("a"), TTL);
        cache.put(&key("/products/9"), payload("b"), TTL);
        cache.put(&key("/productsold"), payload("c"), TTL);
        assert_eq!(cache.invalidate_path("/products"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_is_idempotent() {
        let cache = ResponseCache::new(10);
        cache.put(&key("/a"), payload("a"), TTL);
        cache.put(&key("/b"), payload("b"), TTL);
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.clear(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ResponseCache::new(2);
        let (a, b, c) = (key("/a"), key("/b"), key("/c"));
        cache.put(&a, payload("a"), TTL);
        cache.put(&b, payload("b"), TTL);
        // Reading `a` makes `b` the eviction candidate.
        assert!(cache.get(a.fingerprint()).is_some());
        cache.put(&c, payload("c"), TTL);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(b.fingerprint()).is_none());
        assert!(cache.get(a.fingerprint()).is_some());
        assert!(cache.get(c.fingerprint()).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_access_keeps_budgets_exact() {
        let cache = Arc::new(ResponseCache::new(8));
        let item = |n: usize| (key(&format!("/items/{n}")), payload(&"x".repeat(n % 5 + 1)));

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let (k, body) = item((worker * 7 + i) % 32);
                    match i % 5 {
                        0 => {
                            cache.invalidate("/items/1");
                        }
                        1 | 2 => {
                            cache.get(k.fingerprint());
                        }
                        _ => cache.put(&k, body, TTL),
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = cache.stats();
        assert!(stats.size <= 8, "size {} over capacity", stats.size);
        let remaining: usize = (0..32)
            .filter_map(|n| cache.get(item(n).0.fingerprint()))
            .map(|p| p.weight())
            .sum();
        assert_eq!(stats.bytes, remaining);
        assert_eq!(cache.len(), stats.size);
    }

    #[test]
    fn byte_budget_evicts() {
        // Each payload weighs its body plus "application/json" (16 bytes).
        let cache = ResponseCache::new(100).with_max_bytes(50);
        cache.put(&key("/a"), payload("0123456789"), TTL);
        cache.put(&key("/b"), payload("0123456789"), TTL);
        assert_eq!(cache.stats().bytes, 26);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(key("/b").fingerprint()).is_some());

        cache.put(&key("/huge"), payload(&"x".repeat(100)), TTL);
        assert!(cache.get(key("/huge").fingerprint()).is_none());
    }

    #[test]
    fn stats_track_hit_rate() {
        let cache = ResponseCache::new(10);
        assert_eq!(cache.stats().hit_rate, 0.0);

        let k = key("/a");
        assert!(cache.get(k.fingerprint()).is_none());
        cache.put(&k, payload("a"), TTL);
        assert!(cache.get(k.fingerprint()).is_some());
        assert!(cache.get(k.fingerprint()).is_some());
        assert!(cache.get(k.fingerprint()).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.75);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_stale() {
        let cache = ResponseCache::new(10);
        cache.put(&key("/short"), payload("a"), Duration::from_secs(1));
        cache.put(&key("/long"), payload("b"), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_sweeps_in_background() {
        let cache = Arc::new(ResponseCache::new(10));
        cache.put(&key("/a"), payload("a"), Duration::from_secs(1));
        let reaper = cache.spawn_reaper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(reaper.is_finished());
    }

    #[test]
    fn failures_are_not_captured() {
        let err = CachedResponse::from_response(&Response::new(StatusCode::BadGateway), 10);
        assert_eq!(err, Err(CacheError::NotCacheable(502)));

        let big = Response::new(StatusCode::Ok).body("0123456789A");
        assert_eq!(
            CachedResponse::from_response(&big, 10),
            Err(CacheError::TooLarge { size: 11, max: 10 })
        );
    }

    #[test]
    fn replay_preserves_content() {
        let original = Response::new(StatusCode::Created)
            .header("Content-Type", "application/json")
            .body(r#"{"id":1}"#);
        let replay = CachedResponse::from_response(&original, 1024)
            .unwrap()
            .to_response();
        assert_eq!(replay.status(), StatusCode::Created);
        assert_eq!(replay.content_type(), Some("application/json"));
        assert_eq!(replay.body_ref(), original.body_ref());
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_contains("GET /products?limit=10", "products"));
        assert!(wildcard_contains("GET /products?limit=10", "GET*limit"));
        assert!(wildcard_contains("GET /products?limit=10", "*"));
        assert!(!wildcard_contains("GET /products?limit=10", "limit*products"));
    }
}
