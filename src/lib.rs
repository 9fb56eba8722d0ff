//! # tollgate
//!
//! A response cache and instrumentation layer for HTTP services.
//!
//! [`CacheMiddleware`](middleware::CacheMiddleware) sits in front of an origin
//! handler and, per request:
//!
//! - applies fixed-window rate limiting and progressive slow-down per client,
//! - serves repeated `GET`/`HEAD` requests from an in-memory TTL cache keyed by
//!   a canonical fingerprint of method, path, query and caller identity,
//! - records latency per route and exposes percentiles, hit rates and
//!   cache maintenance through an admin surface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tollgate::{Config, Response, Server, StatusCode, Tollgate};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gate = Tollgate::from_config(&Config::from_toml_str(r#"
//!         [[cache.rules]]
//!         prefix = "/products"
//!         ttl_secs = 300
//!     "#)?)?;
//!     let pipeline = gate.pipeline(|_ctx| async {
//!         Response::new(StatusCode::Ok).body("[]")
//!     });
//!
//!     Server::bind("127.0.0.1:8080").await?
//!         .run(move |req| {
//!             let pipeline = pipeline.clone();
//!             async move { pipeline.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod admission;
pub mod cache;
pub mod config;
pub mod context;
pub mod gate;
pub mod http;
pub mod latency;
pub mod middleware;
pub mod server;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use gate::Tollgate;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
