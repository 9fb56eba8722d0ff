//! The composition root: one [`Tollgate`] owns the cache, the latency
//! recorder and the admission controller, and hands out the middleware and
//! admin views that share them.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::admin::AdminService;
use crate::admission::AdmissionController;
use crate::cache::{ResponseCache, TtlPolicy};
use crate::config::{Config, ConfigError};
use crate::context::{Context, IdentitySource};
use crate::latency::LatencyRecorder;
use crate::middleware::{CacheMiddleware, Pipeline};
use crate::Response;

/// Shared state for one protected service.
///
/// # Examples
///
/// ```rust,no_run
/// use tollgate::{Config, Response, StatusCode, Tollgate};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let gate = Tollgate::from_config(&Config::from_toml_str("")?)?;
/// let pipeline = gate.pipeline(|_ctx| async { Response::new(StatusCode::Ok).body("origin") });
/// let admin = gate.admin();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Tollgate {
    cache: Arc<ResponseCache>,
    policy: Arc<TtlPolicy>,
    latency: Arc<LatencyRecorder>,
    admission: Arc<AdmissionController>,
    identity: IdentitySource,
    caching_enabled: bool,
    identity_header: Option<String>,
    max_entry_bytes: usize,
    invalidate_on_write: bool,
}

impl Tollgate {
    /// Builds every component from `config`, validating it first.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut cache = ResponseCache::new(config.cache.max_entries);
        if let Some(max_bytes) = config.cache.max_bytes {
            cache = cache.with_max_bytes(max_bytes);
        }
        let latency = LatencyRecorder::new(config.metrics.sample_capacity)
            .with_max_routes(config.metrics.max_routes);

        info!(
            caching = config.cache.enabled,
            max_entries = config.cache.max_entries,
            ttl_rules = config.cache.rules.len(),
            scoped_limiters = config.admission.scoped.len(),
            "tollgate configured"
        );

        Ok(Self {
            cache: Arc::new(cache),
            policy: Arc::new(config.cache.policy()),
            latency: Arc::new(latency),
            admission: Arc::new(config.admission.controller()),
            identity: config.admission.identity,
            caching_enabled: config.cache.enabled,
            identity_header: config.cache.identity_header.clone(),
            max_entry_bytes: config.cache.max_entry_bytes,
            invalidate_on_write: config.cache.invalidate_on_write,
        })
    }

    /// A middleware sharing this gate's state.
    pub fn middleware(&self) -> CacheMiddleware {
        let mut middleware = CacheMiddleware::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.policy),
            Arc::clone(&self.latency),
            Arc::clone(&self.admission),
        )
        .caching(self.caching_enabled)
        .max_entry_bytes(self.max_entry_bytes)
        .invalidate_on_write(self.invalidate_on_write);
        if let Some(header) = &self.identity_header {
            middleware = middleware.identity_header(header.clone());
        }
        middleware
    }

    /// `endpoint` behind this gate's middleware, with client identities
    /// resolved as configured.
    pub fn pipeline<H, F>(&self, endpoint: H) -> Pipeline
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Pipeline::new(endpoint)
            .identity(self.identity)
            .layer(self.middleware())
    }

    pub fn admin(&self) -> AdminService {
        AdminService::new(Arc::clone(&self.cache), Arc::clone(&self.latency))
    }

    /// Starts the background sweeps: expired cache entries and idle
    /// admission windows, every `interval`. Both tasks stop once the gate
    /// and all its middleware are dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> [JoinHandle<()>; 2] {
        let reaper = self.cache.spawn_reaper(interval);

        let admission: Weak<AdmissionController> = Arc::downgrade(&self.admission);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(admission) = admission.upgrade() else {
                    break;
                };
                let forgotten = admission.purge_expired();
                if forgotten > 0 {
                    info!(forgotten, "swept idle admission windows");
                }
            }
        });

        [reaper, sweeper]
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn latency(&self) -> &Arc<LatencyRecorder> {
        &self.latency
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, StatusCode};
    use crate::Request;

    fn gate(toml: &str) -> Tollgate {
        Tollgate::from_config(&Config::from_toml_str(toml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pipeline_and_admin_share_state() {
        let gate = gate("");
        let pipeline = gate.pipeline(|_ctx| async { Response::new(StatusCode::Ok).body("[]") });
        pipeline.handle(Request::new(Method::Get, "/products")).await;

        let admin = gate.admin();
        assert_eq!(admin.cache_stats().size, 1);
        assert_eq!(admin.metrics()["GET /products"].count, 1);
        assert_eq!(admin.clear_cache(None), 1);
    }

    #[tokio::test]
    async fn forwarded_identity_is_used_for_admission() {
        let gate = gate(
            r#"
            [admission]
            identity = "forwarded-for"
            [admission.general.rate_limit]
            window_secs = 60
            max_requests = 1
            "#,
        );
        let pipeline = gate.pipeline(|_ctx| async { Response::new(StatusCode::Ok) });
        let from = |ip: &str| Request::new(Method::Post, "/orders").with_header("X-Forwarded-For", ip.to_owned());

        assert_eq!(pipeline.handle(from("198.51.100.1")).await.status(), StatusCode::Ok);
        assert_eq!(pipeline.handle(from("198.51.100.2")).await.status(), StatusCode::Ok);
        assert_eq!(
            pipeline.handle(from("198.51.100.1")).await.status(),
            StatusCode::TooManyRequests
        );
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = Config::default();
        config.metrics.sample_capacity = 0;
        assert!(Tollgate::from_config(&config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_sweeps_and_stops_with_the_gate() {
        let gate = gate("[cache]\ndefault_ttl_secs = 1");
        let pipeline = gate.pipeline(|_ctx| async { Response::new(StatusCode::Ok) });
        pipeline.handle(Request::new(Method::Get, "/products")).await;
        let [reaper, sweeper] = gate.spawn_maintenance(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(gate.cache().is_empty());

        drop(pipeline);
        drop(gate);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(reaper.is_finished());
        assert!(sweeper.is_finished());
    }
}
