use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tollgate::context::Context;
use tollgate::middleware::Pipeline;
use tollgate::{Config, Method, Request, Response, StatusCode, Tollgate};

const CONFIG: &str = r#"
    [cache]
    default_ttl_secs = 60

    [[cache.rules]]
    prefix = "/products"
    ttl_secs = 300

    [admission.general.rate_limit]
    window_secs = 900
    max_requests = 40
"#;

fn setup() -> (Tollgate, Pipeline, Arc<AtomicUsize>) {
    let gate = Tollgate::from_config(&Config::from_toml_str(CONFIG).unwrap()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pipeline = gate.pipeline(move |ctx: Context| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let limit = ctx.request().query_param("limit").unwrap_or("20").to_owned();
            Response::new(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body(format!(r#"{{"limit":{limit}}}"#))
        }
    });
    (gate, pipeline, calls)
}

fn get(target: &str, peer: &str) -> Request {
    let addr: SocketAddr = peer.parse().unwrap();
    Request::new(Method::Get, target).with_peer_addr(addr)
}

#[tokio::test(start_paused = true)]
async fn miss_hit_reject_expire() {
    let (gate, pipeline, calls) = setup();
    let client = "203.0.113.7:40000";

    let first = pipeline.handle(get("/products?limit=10", client)).await;
    assert_eq!(first.status(), StatusCode::Ok);
    assert_eq!(first.headers().get("X-Cache"), Some("MISS"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let second = pipeline.handle(get("/products?limit=10", client)).await;
    assert_eq!(second.headers().get("X-Cache"), Some("HIT"));
    assert_eq!(second.body_ref(), first.body_ref());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    for n in 3..=40 {
        let res = pipeline.handle(get("/products?limit=10", client)).await;
        assert_eq!(res.status(), StatusCode::Ok, "request {n}");
    }
    let rejected = pipeline.handle(get("/products?limit=10", client)).await;
    assert_eq!(rejected.status(), StatusCode::TooManyRequests);
    assert_eq!(rejected.headers().get("Retry-After"), Some("900"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The client stays locked out, so expiry is observed by a second client.
    tokio::time::advance(Duration::from_secs(301)).await;
    let expired = pipeline
        .handle(get("/products?limit=10", "198.51.100.4:40000"))
        .await;
    assert_eq!(expired.headers().get("X-Cache"), Some("MISS"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stats = gate.admin().cache_stats();
    assert_eq!((stats.hits, stats.misses), (39, 2));
    // Rejections never reach a route.
    let snapshot = gate.latency().snapshot("GET /products");
    assert_eq!(snapshot.total, 41);
}

#[tokio::test(start_paused = true)]
async fn window_reset_restores_the_client() {
    let (_gate, pipeline, _calls) = setup();
    let client = "203.0.113.7:40000";

    for _ in 0..40 {
        pipeline.handle(get("/status", client)).await;
    }
    assert_eq!(
        pipeline.handle(get("/status", client)).await.status(),
        StatusCode::TooManyRequests
    );

    tokio::time::advance(Duration::from_secs(900)).await;
    assert_eq!(
        pipeline.handle(get("/status", client)).await.status(),
        StatusCode::Ok
    );
}

#[tokio::test]
async fn admin_clear_forces_a_fresh_fetch() {
    let (gate, pipeline, calls) = setup();
    let client = "203.0.113.7:40000";

    pipeline.handle(get("/products?limit=5", client)).await;
    pipeline.handle(get("/products?limit=10", client)).await;

    let admin = gate.admin();
    let cleared = admin.handle(&Request::new(Method::Post, "/cache/clear?pattern=limit=5"));
    let body: serde_json::Value = serde_json::from_slice(cleared.body_ref()).unwrap();
    assert_eq!(body["removed"], 1);

    let again = pipeline.handle(get("/products?limit=5", client)).await;
    assert_eq!(again.headers().get("X-Cache"), Some("MISS"));
    let other = pipeline.handle(get("/products?limit=10", client)).await;
    assert_eq!(other.headers().get("X-Cache"), Some("HIT"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn served_over_tcp() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (_gate, pipeline, calls) = setup();
    let server = tollgate::Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(
        move |req| {
            let pipeline = pipeline.clone();
            async move { pipeline.handle(req).await }
        },
        async {
            let _ = rx.await;
        },
    ));

    let mut seen = Vec::new();
    for _ in 0..2 {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /products?limit=3 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        seen.push(out);
    }

    assert!(seen[0].contains("X-Cache: MISS"));
    assert!(seen[1].contains("X-Cache: HIT"));
    assert!(seen[1].ends_with(r#"{"limit":3}"#));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
