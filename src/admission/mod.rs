//! Admission control: shed and shape load before it reaches the origin.
//!
//! Two mechanisms are composed per client identity:
//!
//! 1. [`RateLimiter`]: a fixed window with a hard quota; past it requests are
//!    rejected outright.
//! 2. [`SlowDown`]: a softer threshold past which requests are delayed by a
//!    linearly growing, capped amount, but still served.
//!
//! A [`Limiter`] bundles either or both. The [`AdmissionController`] applies a
//! general limiter to every request and any number of scoped limiters to
//! requests under a path prefix; all applicable limiters must admit a request.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::http::path_has_prefix;
use crate::telemetry;

pub mod rate_limit;
pub mod slow_down;
pub mod window;

pub use rate_limit::{Quota, RateDecision, RateLimiter};
pub use slow_down::SlowDown;
pub use window::{FixedWindows, WindowHit};

/// Scope name reported for the general limiter.
pub const GENERAL_SCOPE: &str = "general";

/// A rate limit and/or slow-down applied to one scope.
#[derive(Default)]
pub struct Limiter {
    rate: Option<RateLimiter>,
    slow: Option<SlowDown>,
}

impl Limiter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rate_limit(mut self, limiter: RateLimiter) -> Self {
        self.rate = Some(limiter);
        self
    }

    #[must_use]
    pub fn slow_down(mut self, slow: SlowDown) -> Self {
        self.slow = Some(slow);
        self
    }

    fn purge_expired(&self, now: Instant) -> usize {
        self.rate.as_ref().map_or(0, |r| r.purge_expired(now))
            + self.slow.as_ref().map_or(0, |s| s.purge_expired(now))
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// `general` or the prefix of the scoped limiter that refused.
    pub scope: String,
    pub limit: u64,
    pub retry_after: Duration,
}

impl Rejection {
    /// Machine-readable reason, suitable for a JSON error body.
    pub fn reason(&self) -> &'static str {
        "rate_limited"
    }

    /// `Retry-After` in whole seconds, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        rate_limit::ceil_secs(self.retry_after).max(1)
    }
}

/// The admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed immediately.
    Allowed { quota: Option<Quota> },
    /// Proceed after `delay`. Not a rejection.
    SlowedDown { delay: Duration, quota: Option<Quota> },
    /// Do not invoke the handler.
    RateLimited(Rejection),
}

impl Admission {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::SlowedDown { .. } => "slowed_down",
            Self::RateLimited(r) => r.reason(),
        }
    }

    /// The tightest quota among the limiters that admitted the request.
    pub fn quota(&self) -> Option<Quota> {
        match self {
            Self::Allowed { quota } | Self::SlowedDown { quota, .. } => *quota,
            Self::RateLimited(_) => None,
        }
    }
}

/// Applies the general limiter and every matching scoped limiter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::admission::{Admission, AdmissionController, Limiter, RateLimiter};
///
/// let controller = AdmissionController::new(
///     Limiter::new().rate_limit(RateLimiter::new(Duration::from_secs(60), 100)),
/// )
/// .scoped("/analytics", Limiter::new().rate_limit(RateLimiter::new(Duration::from_secs(60), 1)));
///
/// assert!(matches!(controller.check("c", "/analytics/run"), Admission::Allowed { .. }));
/// assert!(matches!(controller.check("c", "/analytics/run"), Admission::RateLimited(_)));
/// assert!(matches!(controller.check("c", "/products"), Admission::Allowed { .. }));
/// ```
#[derive(Default)]
pub struct AdmissionController {
    general: Limiter,
    scoped: Vec<(String, Limiter)>,
}

impl AdmissionController {
    pub fn new(general: Limiter) -> Self {
        Self {
            general,
            scoped: Vec::new(),
        }
    }

    /// A controller that admits everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Layers `limiter` on requests whose path lies under `prefix`.
    #[must_use]
    pub fn scoped(mut self, prefix: impl Into<String>, limiter: Limiter) -> Self {
        self.scoped.push((prefix.into(), limiter));
        self
    }

    /// Counts the request and decides its fate without waiting.
    ///
    /// Limiters are consulted general first, then scoped in registration
    /// order. The first rejection wins; otherwise the largest slow-down
    /// delay and the tightest quota are reported.
    pub fn check(&self, identity: &str, path: &str) -> Admission {
        let now = Instant::now();
        let applicable = std::iter::once((GENERAL_SCOPE, &self.general)).chain(
            self.scoped
                .iter()
                .filter(|(prefix, _)| path_has_prefix(path, prefix))
                .map(|(prefix, limiter)| (prefix.as_str(), limiter)),
        );

        let mut delay = Duration::ZERO;
        let mut quota: Option<Quota> = None;
        for (scope, limiter) in applicable {
            if let Some(rate) = &limiter.rate {
                match rate.check(identity, now) {
                    RateDecision::Allowed(q) => {
                        quota = Some(match quota {
                            Some(current) if current.remaining <= q.remaining => current,
                            _ => q,
                        });
                    }
                    RateDecision::Limited { limit, retry_after } => {
                        return Admission::RateLimited(Rejection {
                            scope: scope.to_owned(),
                            limit,
                            retry_after,
                        });
                    }
                }
            }
            if let Some(slow) = &limiter.slow {
                delay = delay.max(slow.delay_for(identity, now));
            }
        }

        if delay.is_zero() {
            Admission::Allowed { quota }
        } else {
            Admission::SlowedDown { delay, quota }
        }
    }

    /// Like [`check`](Self::check), but also serves any slow-down delay.
    ///
    /// The wait is a tokio timer, so other requests keep flowing while this
    /// one is held back. If the caller is dropped mid-wait, the quota it
    /// consumed stays consumed.
    pub async fn admit(&self, identity: &str, path: &str) -> Admission {
        let admission = self.check(identity, path);
        match &admission {
            Admission::RateLimited(rejection) => {
                metrics::counter!(telemetry::ADMISSION_REJECTED_TOTAL, "scope" => rejection.scope.clone())
                    .increment(1);
                warn!(
                    client = identity,
                    path,
                    scope = %rejection.scope,
                    retry_after = ?rejection.retry_after,
                    "request rate limited"
                );
            }
            Admission::SlowedDown { delay, .. } => {
                metrics::counter!(telemetry::ADMISSION_DELAYED_TOTAL).increment(1);
                debug!(client = identity, path, delay = ?delay, "request slowed down");
                tokio::time::sleep(*delay).await;
            }
            Admission::Allowed { .. } => {}
        }
        admission
    }

    /// Forgets identities whose windows have closed. Returns the number dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.general.purge_expired(now)
            + self
                .scoped
                .iter()
                .map(|(_, limiter)| limiter.purge_expired(now))
                .sum::<usize>()
    }
}
