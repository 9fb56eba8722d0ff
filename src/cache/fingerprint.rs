//! Cache key derivation.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::Request;
use crate::http::Method;

/// Hex-encoded SHA-256 digest identifying one cacheable request.
///
/// Hashing bounds the key size and keeps raw identity tokens (bearer tokens,
/// session ids) out of logs and admin output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of a request.
    ///
    /// Query parameters are canonicalized first, so `?b=2&a=1` and `?a=1&b=2`
    /// produce the same fingerprint. Fields are separated by bytes that cannot
    /// appear in a request line, so no two distinct inputs share a preimage.
    ///
    /// # Examples
    ///
    /// ```
    /// use tollgate::cache::Fingerprint;
    /// use tollgate::http::Method;
    ///
    /// let a = Fingerprint::build(&Method::Get, "/p", &[("b".into(), "2".into()), ("a".into(), "1".into())], None);
    /// let b = Fingerprint::build(&Method::Get, "/p", &[("a".into(), "1".into()), ("b".into(), "2".into())], None);
    /// assert_eq!(a, b);
    /// assert_eq!(a.as_str().len(), 64);
    /// ```
    pub fn build(
        method: &Method,
        path: &str,
        query: &[(String, String)],
        identity: Option<&str>,
    ) -> Self {
        Self::digest(method, path, &canonical_query(query), identity)
    }

    fn digest(method: &Method, path: &str, canonical_query: &str, identity: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_query.as_bytes());
        hasher.update(b"\n");
        match identity {
            Some(token) => {
                hasher.update(b"1");
                hasher.update(token.as_bytes());
            }
            None => hasher.update(b"0"),
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders query pairs in canonical form: sorted by key then value, each
/// component percent-encoded, joined with `&`.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    pairs.sort_unstable();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Everything the cache needs to know about one request.
///
/// The fingerprint is the map key; the path and tag stay unhashed so
/// entries can be invalidated by pattern and reported in admin output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    fingerprint: Fingerprint,
    path: String,
    tag: String,
}

impl CacheKey {
    /// Derives the key for `request`, partitioned by `identity` when given.
    pub fn for_request(request: &Request, identity: Option<&str>) -> Self {
        let method = request.method();
        let path = request.path();
        let query = canonical_query(request.query_pairs());
        let tag = if query.is_empty() {
            format!("{method} {path}")
        } else {
            format!("{method} {path}?{query}")
        };
        Self {
            fingerprint: Fingerprint::digest(method, path, &query, identity),
            path: path.to_owned(),
            tag,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `METHOD /path?canonical-query`, the string invalidation patterns match.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn same_input_same_fingerprint() {
        let q = pairs(&[("limit", "10")]);
        let a = Fingerprint::build(&Method::Get, "/products", &q, Some("token"));
        let b = Fingerprint::build(&Method::Get, "/products", &q, Some("token"));
        assert_eq!(a, b);
    }

    #[test]
    fn query_order_does_not_matter() {
        let a = Fingerprint::build(&Method::Get, "/p", &pairs(&[("x", "1"), ("y", "2"), ("x", "0")]), None);
        let b = Fingerprint::build(&Method::Get, "/p", &pairs(&[("x", "0"), ("y", "2"), ("x", "1")]), None);
        assert_eq!(a, b);
    }

    #[test]
    fn every_field_participates() {
        let q = pairs(&[("limit", "10")]);
        let base = Fingerprint::build(&Method::Get, "/products", &q, None);
        assert_ne!(base, Fingerprint::build(&Method::Head, "/products", &q, None));
        assert_ne!(base, Fingerprint::build(&Method::Get, "/orders", &q, None));
        assert_ne!(base, Fingerprint::build(&Method::Get, "/products", &pairs(&[("limit", "11")]), None));
        assert_ne!(base, Fingerprint::build(&Method::Get, "/products", &q, Some("alice")));
    }

    #[test]
    fn empty_identity_differs_from_none() {
        let a = Fingerprint::build(&Method::Get, "/", &[], None);
        let b = Fingerprint::build(&Method::Get, "/", &[], Some(""));
        assert_ne!(a, b);
    }

    #[test]
    fn separators_cannot_be_forged_through_values() {
        let a = Fingerprint::build(&Method::Get, "/p", &pairs(&[("a", "1&b=2")]), None);
        let b = Fingerprint::build(&Method::Get, "/p", &pairs(&[("a", "1"), ("b", "2")]), None);
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_query_sorts_and_encodes() {
        let q = pairs(&[("q", "red shoes"), ("a", "x/y")]);
        assert_eq!(canonical_query(&q), "a=x%2Fy&q=red%20shoes");
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn cache_key_tag_is_unhashed() {
        let req = Request::new(Method::Get, "/products?sort=name&limit=10");
        let key = CacheKey::for_request(&req, Some("secret-token"));
        assert_eq!(key.tag(), "GET /products?limit=10&sort=name");
        assert_eq!(key.path(), "/products");
        assert!(!key.fingerprint().as_str().contains("secret"));

        let bare = CacheKey::for_request(&Request::new(Method::Get, "/status"), None);
        assert_eq!(bare.tag(), "GET /status");
    }

    #[test]
    fn cache_key_matches_build() {
        let req = Request::new(Method::Get, "/products?limit=10");
        let key = CacheKey::for_request(&req, None);
        let direct = Fingerprint::build(&Method::Get, "/products", req.query_pairs(), None);
        assert_eq!(key.fingerprint(), &direct);
    }
}
