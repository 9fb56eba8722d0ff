//! Operator-facing JSON endpoints, served on their own listener.
//!
//! | Method | Path           | Result                                      |
//! |--------|----------------|---------------------------------------------|
//! | GET    | `/metrics`     | latency snapshot per route                  |
//! | GET    | `/cache/stats` | cache size, budget and hit rate             |
//! | POST   | `/cache/clear` | clear all, or `?pattern=` to invalidate     |
//! | GET    | `/health`      | `{"status":"ok"}`                           |
//!
//! These are never mounted on the public pipeline: clearing the cache or
//! reading per-route timings is an operator capability.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::cache::{CacheStats, ResponseCache};
use crate::http::{Method, Response, StatusCode};
use crate::latency::{LatencyRecorder, LatencySnapshot};
use crate::Request;

/// Read and maintenance access to a gate's shared state.
#[derive(Clone)]
pub struct AdminService {
    cache: Arc<ResponseCache>,
    latency: Arc<LatencyRecorder>,
}

impl AdminService {
    pub fn new(cache: Arc<ResponseCache>, latency: Arc<LatencyRecorder>) -> Self {
        Self { cache, latency }
    }

    /// Latency snapshot for every route seen so far, keyed `"METHOD path"`.
    pub fn metrics(&self) -> BTreeMap<String, LatencySnapshot> {
        self.latency.all_snapshots()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Clears the whole cache, or only entries matching `pattern`.
    ///
    /// Returns the number of entries removed.
    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        match pattern.filter(|p| !p.is_empty()) {
            Some(pattern) => self.cache.invalidate(pattern),
            None => self.cache.clear(),
        }
    }

    /// Dispatches an admin request.
    pub fn handle(&self, request: &Request) -> Response {
        let method = request.method();
        match request.path() {
            "/metrics" => match method {
                Method::Get => Response::json(StatusCode::Ok, &self.metrics()),
                _ => method_not_allowed("GET"),
            },
            "/cache/stats" => match method {
                Method::Get => Response::json(StatusCode::Ok, &self.cache_stats()),
                _ => method_not_allowed("GET"),
            },
            "/cache/clear" => match method {
                Method::Post => {
                    let pattern = request.query_param("pattern");
                    let removed = self.clear_cache(pattern);
                    info!(?pattern, removed, "cache cleared via admin");
                    Response::json(StatusCode::Ok, &json!({ "removed": removed }))
                }
                _ => method_not_allowed("POST"),
            },
            "/health" => Response::json(StatusCode::Ok, &json!({ "status": "ok" })),
            path => Response::json(
                StatusCode::NotFound,
                &json!({ "error": "not_found", "path": path }),
            ),
        }
    }
}

fn method_not_allowed(allow: &'static str) -> Response {
    Response::json(
        StatusCode::MethodNotAllowed,
        &json!({ "error": "method_not_allowed" }),
    )
    .header("Allow", allow)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheKey, CachedResponse};

    fn admin() -> AdminService {
        let cache = Arc::new(ResponseCache::new(10));
        let latency = Arc::new(LatencyRecorder::default());
        for target in ["/products?limit=10", "/products?limit=20", "/orders"] {
            let key = CacheKey::for_request(&Request::new(Method::Get, target), None);
            let payload =
                CachedResponse::from_response(&Response::new(StatusCode::Ok).body("x"), 64).unwrap();
            cache.put(&key, payload, Duration::from_secs(60));
        }
        latency.record("GET /products", Duration::from_millis(12));
        AdminService::new(cache, latency)
    }

    fn json_body(res: &Response) -> serde_json::Value {
        serde_json::from_slice(res.body_ref()).unwrap()
    }

    #[test]
    fn metrics_lists_routes() {
        let res = admin().handle(&Request::new(Method::Get, "/metrics"));
        assert_eq!(res.status(), StatusCode::Ok);
        let body = json_body(&res);
        assert_eq!(body["GET /products"]["count"], 1);
        assert_eq!(body["GET /products"]["p50_ms"], 12.0);
    }

    #[test]
    fn cache_stats_reports_size() {
        let res = admin().handle(&Request::new(Method::Get, "/cache/stats"));
        assert_eq!(json_body(&res)["size"], 3);
    }

    #[test]
    fn clear_with_pattern_invalidates_matches() {
        let admin = admin();
        let res = admin.handle(&Request::new(Method::Post, "/cache/clear?pattern=/products*"));
        assert_eq!(json_body(&res)["removed"], 2);
        assert_eq!(admin.cache_stats().size, 1);
    }

    #[test]
    fn clear_without_pattern_empties_everything() {
        let admin = admin();
        assert_eq!(admin.clear_cache(None), 3);
        assert_eq!(admin.clear_cache(None), 0);
        assert_eq!(admin.clear_cache(Some("")), 0);
    }

    #[test]
    fn wrong_method_is_405() {
        let res = admin().handle(&Request::new(Method::Get, "/cache/clear"));
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("Allow"), Some("POST"));
    }

    #[test]
    fn unknown_path_is_404() {
        let res = admin().handle(&Request::new(Method::Get, "/nope"));
        assert_eq!(res.status(), StatusCode::NotFound);
    }
}
