//! tollgated: runs a demo origin behind the tollgate middleware.
//!
//! The public listener serves the protected pipeline; the admin listener
//! serves `/metrics`, `/cache/stats` and `/cache/clear`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::context::Context;
use tollgate::{Config, Method, Response, Server, StatusCode, Tollgate};

/// Response cache and admission control daemon.
#[derive(Parser)]
#[command(name = "tollgated")]
#[command(version)]
#[command(about = "Response cache, rate limiting and latency metrics in front of a demo origin")]
struct Args {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info,tollgated=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let gate = Tollgate::from_config(&config)?;
    let _maintenance = gate.spawn_maintenance(config.cache.sweep_interval());

    let pipeline = gate.pipeline(origin);
    let admin = gate.admin();

    let public = Server::bind(&config.server.listen).await?;
    let admin_server = Server::bind(&config.server.admin_listen).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %public.local_addr(),
        admin = %admin_server.local_addr(),
        "tollgated starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let public_task = public.run_until(
        move |req| {
            let pipeline = pipeline.clone();
            async move { pipeline.handle(req).await }
        },
        shutdown_signal(shutdown_rx.clone()),
    );
    let admin_task = admin_server.run_until(
        move |req| {
            let response = admin.handle(&req);
            async move { response }
        },
        shutdown_signal(shutdown_rx),
    );

    tokio::try_join!(public_task, admin_task)?;
    Ok(())
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = rx.wait_for(|stop| *stop).await;
}

#[derive(Deserialize)]
struct NewProduct {
    name: String,
    #[serde(default)]
    price_cents: u64,
}

/// A small catalogue service standing in for a real backend.
async fn origin(ctx: Context) -> Response {
    let request = ctx.request();
    match (request.method(), request.path()) {
        (Method::Get | Method::Head, "/status") => {
            Response::json(StatusCode::Ok, &json!({ "status": "ok" }))
        }
        (Method::Get | Method::Head, "/products") => {
            let limit = request
                .query_param("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(20)
                .min(100);
            // Simulated database round trip.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let products: Vec<_> = (1..=limit)
                .map(|id| json!({ "id": id, "name": format!("product-{id}") }))
                .collect();
            Response::json(StatusCode::Ok, &products)
        }
        (Method::Post, "/products") => match ctx.json::<NewProduct>() {
            Ok(product) => Response::json(
                StatusCode::Created,
                &json!({ "created": true, "name": product.name, "price_cents": product.price_cents }),
            ),
            Err(e) => Response::json(
                StatusCode::BadRequest,
                &json!({ "error": "invalid_body", "detail": e.to_string() }),
            ),
        },
        (Method::Get | Method::Head, path) if path.starts_with("/reports/") => {
            // Reports are expensive to build.
            tokio::time::sleep(Duration::from_millis(400)).await;
            let name = &path["/reports/".len()..];
            Response::json(StatusCode::Ok, &json!({ "report": name, "rows": 1_000 }))
        }
        (_, path) => Response::json(
            StatusCode::NotFound,
            &json!({ "error": "not_found", "path": path }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate::Request;

    #[tokio::test]
    async fn create_product_reads_json_body() {
        let req = Request::new(Method::Post, "/products").with_body(r#"{"name":"mug","price_cents":899}"#);
        let res = origin(Context::new(req)).await;
        assert_eq!(res.status(), StatusCode::Created);
        let body: serde_json::Value = serde_json::from_slice(res.body_ref()).unwrap();
        assert_eq!(body["name"], "mug");
        assert_eq!(body["price_cents"], 899);
    }

    #[tokio::test]
    async fn create_product_rejects_malformed_body() {
        let req = Request::new(Method::Post, "/products").with_body("name=mug");
        let res = origin(Context::new(req)).await;
        assert_eq!(res.status(), StatusCode::BadRequest);
    }
}
