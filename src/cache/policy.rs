//! Route-specific cache lifetimes.

use std::time::Duration;

use crate::http::path_has_prefix;

/// One `(prefix, ttl)` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlRule {
    pub prefix: String,
    pub ttl: Duration,
}

/// Maps request paths to cache lifetimes by longest matching prefix.
///
/// Prefixes match on segment boundaries (see [`path_has_prefix`]). When no
/// rule matches, the default TTL applies.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::cache::TtlPolicy;
///
/// let policy = TtlPolicy::new(Duration::from_secs(60))
///     .rule("/reports", Duration::from_secs(900))
///     .rule("/reports/live", Duration::from_secs(5));
///
/// assert_eq!(policy.ttl_for("/reports/weekly"), Duration::from_secs(900));
/// assert_eq!(policy.ttl_for("/reports/live/cpu"), Duration::from_secs(5));
/// assert_eq!(policy.ttl_for("/products"), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    // Kept sorted longest prefix first so the first hit is the best hit.
    rules: Vec<TtlRule>,
    default_ttl: Duration,
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            default_ttl,
        }
    }

    /// Adds a rule. A later rule with an identical prefix replaces the earlier one.
    #[must_use]
    pub fn rule(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        let prefix = prefix.into();
        self.rules.retain(|r| r.prefix != prefix);
        self.rules.push(TtlRule { prefix, ttl });
        self.rules
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then_with(|| a.prefix.cmp(&b.prefix)));
        self
    }

    /// Returns the TTL for `path`.
    pub fn ttl_for(&self, path: &str) -> Duration {
        self.rules
            .iter()
            .find(|r| path_has_prefix(path, &r.prefix))
            .map_or(self.default_ttl, |r| r.ttl)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn rules(&self) -> &[TtlRule] {
        &self.rules
    }
}
