//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses and response decoration without coupling handlers
//! to infrastructure concerns. The chain ends in an [`Endpoint`]: the real
//! downstream handler the host wants to protect.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; consumed by [`Next::run`], so a
//!   middleware can invoke the downstream handler at most once.
//! - [`Pipeline`]: an ordered middleware stack plus its endpoint.
//! - [`CacheMiddleware`]: admission control, response caching and latency
//!   recording in one layer.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    Request, Response,
    context::{Context, IdentitySource},
};

pub mod cache;

pub use cache::CacheMiddleware;

/// Boxed response future returned by middleware and endpoints.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxFuture + Send + Sync + 'static>;

/// The terminal handler of a pipeline.
pub type Endpoint = Arc<dyn Fn(Context) -> BoxFuture + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Arc<Vec<MiddlewareHandler>>,
    endpoint: Endpoint,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `middlewares`.
    pub fn new(middlewares: Arc<Vec<MiddlewareHandler>>, endpoint: Endpoint) -> Self {
        Self {
            middlewares,
            endpoint,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain, or the endpoint once the
    /// chain is exhausted, and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations must not hold a lock guard across an `.await` point.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture;
}

/// An ordered middleware stack terminating in an endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use tollgate::{Request, Response, StatusCode};
/// use tollgate::http::Method;
/// use tollgate::middleware::Pipeline;
///
/// # async fn example() {
/// let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok).body("origin") });
/// let response = pipeline.handle(Request::new(Method::Get, "/")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<Vec<MiddlewareHandler>>,
    endpoint: Endpoint,
    identity: IdentitySource,
}

impl Pipeline {
    /// Creates a pipeline with no middleware in front of `endpoint`.
    pub fn new<H, F>(endpoint: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let endpoint: Endpoint = Arc::new(move |ctx| Box::pin(endpoint(ctx)));
        Self {
            middlewares: Arc::new(Vec::new()),
            endpoint,
            identity: IdentitySource::default(),
        }
    }

    /// Appends a middleware. Layers run in the order they are added.
    #[must_use]
    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        Arc::make_mut(&mut self.middlewares).push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Sets how client identities are derived from incoming requests.
    #[must_use]
    pub fn identity(mut self, source: IdentitySource) -> Self {
        self.identity = source;
        self
    }

    /// Runs `request` through every layer and the endpoint.
    pub async fn handle(&self, request: Request) -> Response {
        let client = self.identity.resolve(&request);
        let ctx = Context::with_client(request, client);
        Next::new(Arc::clone(&self.middlewares), Arc::clone(&self.endpoint))
            .run(ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;
    use crate::http::Method;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxFuture {
            let tag = self.0;
            Box::pin(async move {
                let mut response = next.run(ctx).await;
                let seen = response.headers().get("x-order").unwrap_or("").to_owned();
                response.set_header("X-Order", format!("{seen}{tag}"));
                response
            })
        }
    }

    struct Reject;

    impl Middleware for Reject {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxFuture {
            Box::pin(async { Response::new(StatusCode::Forbidden) })
        }
    }

    #[tokio::test]
    async fn empty_pipeline_reaches_endpoint() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Accepted) });
        let res = pipeline.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::Accepted);
    }

    #[tokio::test]
    async fn layers_unwind_innermost_first() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok) })
            .layer(Tag("a"))
            .layer(Tag("b"));
        let res = pipeline.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.headers().get("x-order"), Some("ba"));
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let pipeline = Pipeline::new(|_ctx| async { Response::new(StatusCode::Ok) }).layer(Reject);
        let res = pipeline.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn identity_source_is_applied() {
        let pipeline = Pipeline::new(|ctx: Context| async move {
            Response::new(StatusCode::Ok).body(ctx.client().to_owned())
        })
        .identity(IdentitySource::ForwardedFor);
        let req = Request::new(Method::Get, "/").with_header("X-Forwarded-For", "198.51.100.2");
        let res = pipeline.handle(req).await;
        assert_eq!(res.body_ref().as_ref(), b"198.51.100.2");
    }
}
