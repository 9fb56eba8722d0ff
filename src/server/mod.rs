//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function, keeping connections alive between requests. Each request is
//! stamped with the peer address so admission control can identify clients.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Largest request (headers plus body) buffered before answering 413 (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

const INITIAL_BUF_SIZE: usize = 4096;

/// A bound HTTP/1.1 listener.
///
/// # Examples
///
/// ```rust,no_run
/// use tollgate::{Config, Response, Server, StatusCode, Tollgate};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let gate = Tollgate::from_config(&Config::default())?;
///     let pipeline = gate.pipeline(|_ctx| async { Response::new(StatusCode::Ok).body("Hello!") });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server
///         .run(move |req| {
///             let pipeline = pipeline.clone();
///             async move { pipeline.handle(req).await }
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until the process exits.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then stops accepting.
    ///
    /// Connections already accepted finish their in-flight request on their
    /// own tasks.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Reads requests off one connection until the peer closes it or asks to.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;
        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            stream.write_all(&too_large().into_bytes()).await?;
            break;
        }

        let (mut request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let content_length = request.content_length().unwrap_or(0);
        // Checked before waiting for the body.
        let total_needed = match body_offset.checked_add(content_length) {
            Some(total) if total <= MAX_REQUEST_SIZE => total,
            _ => {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                stream.write_all(&too_large().into_bytes()).await?;
                break;
            }
        };
        if buf.len() < total_needed {
            continue;
        }
        // Pipelined bytes after the body belong to the next request.
        request.truncate_body(content_length);
        let request = request.with_peer_addr(peer_addr);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = handler(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        let _ = buf.split_to(total_needed);

        if !keep_alive {
            break;
        }
    }

    Ok(())
}

fn too_large() -> Response {
    Response::new(StatusCode::PayloadTooLarge)
        .body("Request entity too large")
        .keep_alive(false)
}
