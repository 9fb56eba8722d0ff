//! Configuration for the gate and the `tollgated` daemon.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file is a
//! valid configuration:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! admin_listen = "127.0.0.1:9090"
//!
//! [cache]
//! default_ttl_secs = 60
//! identity_header = "Authorization"
//!
//! [[cache.rules]]
//! prefix = "/products"
//! ttl_secs = 300
//!
//! [admission]
//! identity = "forwarded-for"
//!
//! [admission.general.rate_limit]
//! window_secs = 900
//! max_requests = 100
//!
//! [[admission.scoped]]
//! prefix = "/reports"
//! rate_limit = { window_secs = 60, max_requests = 5 }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::admission::{AdmissionController, Limiter, RateLimiter, SlowDown};
use crate::cache::TtlPolicy;
use crate::context::IdentitySource;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Listener addresses for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public address the protected pipeline is served on (default: 127.0.0.1:8080).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Address of the admin surface (default: 127.0.0.1:9090).
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

/// Response cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entry budget (default: 10 000).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Optional budget on the summed size of cached bodies.
    #[serde(default)]
    pub max_bytes: Option<usize>,
    /// Responses larger than this are served but not stored (default: 1 MiB).
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
    /// TTL for paths no rule matches (default: 60).
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// How often expired entries and idle admission windows are swept (default: 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Header whose value partitions cache entries per caller.
    #[serde(default)]
    pub identity_header: Option<String>,
    /// Drop cached reads under a resource after a successful write to it.
    #[serde(default)]
    pub invalidate_on_write: bool,
    #[serde(default)]
    pub rules: Vec<TtlRuleConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            max_bytes: None,
            max_entry_bytes: default_max_entry_bytes(),
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval(),
            identity_header: None,
            invalidate_on_write: false,
            rules: Vec::new(),
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> TtlPolicy {
        self.rules.iter().fold(
            TtlPolicy::new(Duration::from_secs(self.default_ttl_secs)),
            |policy, rule| policy.rule(rule.prefix.clone(), Duration::from_secs(rule.ttl_secs)),
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    crate::cache::store::DEFAULT_MAX_ENTRIES
}

fn default_max_entry_bytes() -> usize {
    crate::middleware::cache::DEFAULT_MAX_ENTRY_BYTES
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

/// A path prefix with its own TTL.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlRuleConfig {
    pub prefix: String,
    pub ttl_secs: u64,
}

/// Latency sampling settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Samples kept per route (default: 100).
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// Distinct route keys tracked before new ones fold into `OTHER` (default: 1 000).
    #[serde(default = "default_max_routes")]
    pub max_routes: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_capacity: default_sample_capacity(),
            max_routes: default_max_routes(),
        }
    }
}

fn default_sample_capacity() -> usize {
    crate::latency::DEFAULT_SAMPLE_CAPACITY
}

fn default_max_routes() -> usize {
    crate::latency::DEFAULT_MAX_ROUTES
}

/// Rate limiting and slow-down settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// How clients are identified (default: peer address).
    #[serde(default)]
    pub identity: IdentitySource,
    /// Applied to every request.
    #[serde(default = "default_general_limiter")]
    pub general: LimiterConfig,
    /// Layered on top of `general` for requests under `prefix`.
    #[serde(default)]
    pub scoped: Vec<ScopedLimiterConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            identity: IdentitySource::default(),
            general: default_general_limiter(),
            scoped: Vec::new(),
        }
    }
}

impl AdmissionConfig {
    pub fn controller(&self) -> AdmissionController {
        self.scoped.iter().fold(
            AdmissionController::new(self.general.limiter()),
            |controller, scoped| controller.scoped(scoped.prefix.clone(), scoped.limiter.limiter()),
        )
    }
}

fn default_general_limiter() -> LimiterConfig {
    LimiterConfig {
        rate_limit: Some(RateLimitConfig::default()),
        slow_down: Some(SlowDownConfig::default()),
    }
}

/// Either or both admission mechanisms for one scope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub slow_down: Option<SlowDownConfig>,
}

impl LimiterConfig {
    pub fn limiter(&self) -> Limiter {
        let mut limiter = Limiter::new();
        if let Some(rate) = &self.rate_limit {
            limiter = limiter.rate_limit(RateLimiter::new(
                Duration::from_secs(rate.window_secs),
                rate.max_requests,
            ));
        }
        if let Some(slow) = &self.slow_down {
            limiter = limiter.slow_down(SlowDown::new(
                Duration::from_secs(slow.window_secs),
                slow.delay_after,
                Duration::from_millis(slow.delay_ms),
                Duration::from_millis(slow.max_delay_ms),
            ));
        }
        limiter
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if let Some(rate) = &self.rate_limit {
            if rate.window_secs == 0 {
                return Err(invalid(format!("{scope}: rate_limit.window_secs must be non-zero")));
            }
        }
        if let Some(slow) = &self.slow_down {
            if slow.window_secs == 0 {
                return Err(invalid(format!("{scope}: slow_down.window_secs must be non-zero")));
            }
            if slow.max_delay_ms < slow.delay_ms {
                return Err(invalid(format!(
                    "{scope}: slow_down.max_delay_ms ({}) is below delay_ms ({})",
                    slow.max_delay_ms, slow.delay_ms
                )));
            }
        }
        if let (Some(rate), Some(slow)) = (&self.rate_limit, &self.slow_down) {
            if slow.delay_after >= rate.max_requests {
                return Err(invalid(format!(
                    "{scope}: slow_down.delay_after ({}) must be below rate_limit.max_requests ({})",
                    slow.delay_after, rate.max_requests
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopedLimiterConfig {
    pub prefix: String,
    #[serde(flatten)]
    pub limiter: LimiterConfig,
}

/// Hard quota per fixed window (default: 100 per 15 minutes).
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

/// Progressive delay past a soft threshold (default: after 50, +500 ms each, max 20 s).
#[derive(Debug, Clone, Deserialize)]
pub struct SlowDownConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_delay_after")]
    pub delay_after: u64,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            delay_after: default_delay_after(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_window_secs() -> u64 {
    15 * 60
}

fn default_max_requests() -> u64 {
    100
}

fn default_delay_after() -> u64 {
    50
}

fn default_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make a component misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries must be non-zero".into()));
        }
        if self.cache.max_bytes == Some(0) {
            return Err(invalid("cache.max_bytes must be non-zero when set".into()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(invalid("cache.sweep_interval_secs must be non-zero".into()));
        }
        for rule in &self.cache.rules {
            if !rule.prefix.starts_with('/') {
                return Err(invalid(format!(
                    "cache rule prefix {:?} must start with '/'",
                    rule.prefix
                )));
            }
        }
        if self.metrics.sample_capacity == 0 {
            return Err(invalid("metrics.sample_capacity must be non-zero".into()));
        }
        if self.metrics.max_routes == 0 {
            return Err(invalid("metrics.max_routes must be non-zero".into()));
        }

        self.admission.general.validate("admission.general")?;
        for scoped in &self.admission.scoped {
            if !scoped.prefix.starts_with('/') {
                return Err(invalid(format!(
                    "admission scope prefix {:?} must start with '/'",
                    scoped.prefix
                )));
            }
            scoped
                .limiter
                .validate(&format!("admission.scoped[{}]", scoped.prefix))?;
        }
        Ok(())
    }
}
