//! HTTP header map with case-insensitive name lookup.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order, which keeps serialized responses stable and
/// lets cached payloads be replayed byte-for-byte.
///
/// # Examples
///
/// ```
/// use tollgate::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("X-Cache", "MISS");
/// headers.set("x-cache", "HIT");
///
/// assert_eq!(headers.get("X-CACHE"), Some("HIT"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` with a single value.
    ///
    /// Observability headers use this so a response that passes through the
    /// middleware twice never carries two conflicting `X-Cache` values.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/json");
        assert_eq!(h.get("content-type"), Some("application/json"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn set_replaces_all_previous_values() {
        let mut h = Headers::new();
        h.insert("X-Cache", "MISS");
        h.insert("x-cache", "MISS");
        h.set("X-Cache", "HIT");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("x-cache"), Some("HIT"));
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("Retry-After", "10");
        assert!(h.remove("retry-after"));
        assert!(h.is_empty());
        assert!(!h.remove("retry-after"));
    }

    #[test]
    fn display_uses_wire_format() {
        let mut h = Headers::new();
        h.insert("A", "1");
        h.insert("B", "2");
        assert_eq!(h.to_string(), "A: 1\r\nB: 2\r\n");
    }
}
