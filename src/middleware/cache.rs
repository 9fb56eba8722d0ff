//! The orchestrating middleware: admission, cache lookup, origin call, store, timing.
//!
//! Per request:
//!
//! ```text
//! admission ──rejected──────────────────────────────────────▶ 429
//!     │ (slow-down delay served here)
//!     ▼
//! cacheable? ──no──▶ origin ─────────────────────────────────▶ BYPASS
//!     │ yes
//!     ▼
//! lookup ──hit───────────────────────────────────────────────▶ HIT
//!     │ miss
//!     ▼
//! origin ──2xx──▶ store (TTL from policy) ──────────────────▶ MISS
//! ```
//!
//! Latency is measured from the admission check to the final response, so
//! operators see slow-down delays in the same metrics as origin time. Cache
//! hits are recorded under the same route key as misses. Rate-limited
//! requests are not sampled: they never reach a route.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::{BoxFuture, Middleware, Next};
use crate::admission::{Admission, AdmissionController, Quota, Rejection};
use crate::cache::{CacheError, CacheKey, CachedResponse, ResponseCache, TtlPolicy};
use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::latency::LatencyRecorder;
use crate::telemetry;

/// Default per-entry size limit (1 MiB).
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;

pub const CACHE_HEADER: &str = "X-Cache";
pub const RESPONSE_TIME_HEADER: &str = "X-Response-Time";
pub const SLOW_DOWN_HEADER: &str = "X-Slow-Down-Delay";

/// How a response was produced, as reported in the `X-Cache` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// The method is not cacheable or caching is disabled.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

/// Records a latency sample exactly once, even if the request future is dropped.
struct LatencyTimer {
    recorder: Arc<LatencyRecorder>,
    route_key: Option<String>,
    start: Instant,
}

impl LatencyTimer {
    fn start(recorder: Arc<LatencyRecorder>, route_key: String) -> Self {
        Self {
            recorder,
            route_key: Some(route_key),
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.start)
    }

    fn finish(mut self, status: StatusCode, cache: CacheStatus) {
        let Some(route_key) = self.route_key.take() else {
            return;
        };
        let elapsed = self.elapsed();
        if status.is_server_error() {
            self.recorder.record_failed(&route_key, elapsed);
        } else {
            self.recorder.record(&route_key, elapsed);
        }
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "cache" => cache.as_str())
            .record(elapsed.as_secs_f64());
    }

    fn discard(mut self) {
        self.route_key = None;
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        if let Some(route_key) = self.route_key.take() {
            let elapsed = self.elapsed();
            debug!(route = %route_key, ?elapsed, "request abandoned before completion");
            self.recorder.record_failed(&route_key, elapsed);
        }
    }
}

/// Admission control, response caching and latency recording in one layer.
///
/// Usually obtained from [`Tollgate::middleware`](crate::Tollgate::middleware)
/// so that it shares state with the admin surface.
#[derive(Clone)]
pub struct CacheMiddleware {
    cache: Arc<ResponseCache>,
    policy: Arc<TtlPolicy>,
    latency: Arc<LatencyRecorder>,
    admission: Arc<AdmissionController>,
    caching_enabled: bool,
    identity_header: Option<String>,
    max_entry_bytes: usize,
    invalidate_on_write: bool,
}

impl CacheMiddleware {
    pub fn new(
        cache: Arc<ResponseCache>,
        policy: Arc<TtlPolicy>,
        latency: Arc<LatencyRecorder>,
        admission: Arc<AdmissionController>,
    ) -> Self {
        Self {
            cache,
            policy,
            latency,
            admission,
            caching_enabled: true,
            identity_header: None,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
            invalidate_on_write: false,
        }
    }

    /// Turns response caching on or off; admission and timing always apply.
    #[must_use]
    pub fn caching(mut self, enabled: bool) -> Self {
        self.caching_enabled = enabled;
        self
    }

    /// Partitions cache entries by the value of `header` (e.g. `Authorization`).
    #[must_use]
    pub fn identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = Some(header.into());
        self
    }

    #[must_use]
    pub fn max_entry_bytes(mut self, max: usize) -> Self {
        self.max_entry_bytes = max;
        self
    }

    /// After a successful write (POST/PUT/PATCH/DELETE), drop cached reads
    /// under the same top-level path segment.
    #[must_use]
    pub fn invalidate_on_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_write = enabled;
        self
    }

    async fn process(self, ctx: Context, next: Next) -> Response {
        let method = ctx.request().method().clone();
        let path = ctx.request().path().to_owned();
        let timer = LatencyTimer::start(Arc::clone(&self.latency), format!("{method} {path}"));

        let admission = self.admission.admit(ctx.client(), &path).await;
        if let Admission::RateLimited(rejection) = &admission {
            let mut response = rejection_response(rejection);
            response.set_header(RESPONSE_TIME_HEADER, format_elapsed(timer.elapsed()));
            timer.discard();
            return response;
        }

        let key = (self.caching_enabled && method.is_cacheable()).then(|| {
            let identity = self
                .identity_header
                .as_deref()
                .and_then(|h| ctx.request().headers().get(h));
            CacheKey::for_request(ctx.request(), identity)
        });

        if let Some(key) = &key {
            if let Some(cached) = self.cache.get(key.fingerprint()) {
                debug!(tag = key.tag(), "cache hit");
                let mut response = cached.to_response();
                self.decorate(&mut response, &admission, CacheStatus::Hit, &timer);
                timer.finish(response.status(), CacheStatus::Hit);
                return response;
            }
        }

        let mut response = next.run(ctx).await;

        let status = match &key {
            Some(key) => {
                self.store(key, &response);
                CacheStatus::Miss
            }
            None => CacheStatus::Bypass,
        };

        if self.invalidate_on_write && method.is_write() && response.status().is_success() {
            if let Some(root) = resource_root(&path) {
                self.cache.invalidate_path(root);
            }
        }

        self.decorate(&mut response, &admission, status, &timer);
        timer.finish(response.status(), status);
        response
    }

    fn store(&self, key: &CacheKey, response: &Response) {
        match CachedResponse::from_response(response, self.max_entry_bytes) {
            Ok(payload) => {
                let ttl = self.policy.ttl_for(key.path());
                debug!(tag = key.tag(), ?ttl, "cache store");
                self.cache.put(key, payload, ttl);
            }
            Err(CacheError::NotCacheable(status)) => {
                debug!(tag = key.tag(), status, "origin response not cached");
            }
            Err(e) => {
                warn!(tag = key.tag(), error = %e, "response could not be cached");
            }
        }
    }

    fn decorate(
        &self,
        response: &mut Response,
        admission: &Admission,
        cache: CacheStatus,
        timer: &LatencyTimer,
    ) {
        response.set_header(CACHE_HEADER, cache.as_str());
        if let Some(quota) = admission.quota() {
            set_quota_headers(response, &quota);
        }
        if let Admission::SlowedDown { delay, .. } = admission {
            response.set_header(SLOW_DOWN_HEADER, delay.as_millis().to_string());
        }
        response.set_header(RESPONSE_TIME_HEADER, format_elapsed(timer.elapsed()));
    }
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
        Box::pin(self.clone().process(ctx, next))
    }
}

fn set_quota_headers(response: &mut Response, quota: &Quota) {
    response.set_header("X-RateLimit-Limit", quota.limit.to_string());
    response.set_header("X-RateLimit-Remaining", quota.remaining.to_string());
    response.set_header("X-RateLimit-Reset", quota.resets_in_secs().to_string());
}

/// `429 Too Many Requests` with a `Retry-After` hint and a JSON reason.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let retry_after = rejection.retry_after_secs();
    Response::json(
        StatusCode::TooManyRequests,
        &serde_json::json!({
            "error": rejection.reason(),
            "message": "Too many requests, please try again later.",
            "scope": rejection.scope,
            "retry_after_secs": retry_after,
        }),
    )
    .header("Retry-After", retry_after.to_string())
    .header("X-RateLimit-Limit", rejection.limit.to_string())
    .header("X-RateLimit-Remaining", "0")
}

fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0)
}

/// `/products/7/reviews` → `/products`.
fn resource_root(path: &str) -> Option<&str> {
    let trimmed = path.strip_prefix('/')?;
    let end = trimmed.find('/').map_or(path.len(), |i| i + 1);
    (end > 1).then(|| &path[..end])
}
