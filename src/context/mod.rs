//! Per-request context: the request plus the identity of the client that sent it.
//!
//! Admission control counts requests per client, so the identity is resolved
//! once when the request enters the [`Pipeline`](crate::middleware::Pipeline)
//! and carried alongside the request from then on.

use serde::Deserialize;

use crate::Request;

/// Identity recorded for requests whose origin cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where the client identity used for rate limiting comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySource {
    /// The IP address of the TCP peer.
    #[default]
    Peer,
    /// The first hop of `X-Forwarded-For`, falling back to the peer address.
    ///
    /// Only safe behind a proxy that overwrites the header.
    ForwardedFor,
}

impl IdentitySource {
    /// Resolves the client identity for `request`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tollgate::Request;
    /// use tollgate::context::IdentitySource;
    /// use tollgate::http::Method;
    ///
    /// let req = Request::new(Method::Get, "/")
    ///     .with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
    ///     .with_peer_addr("10.0.0.1:4000".parse().unwrap());
    ///
    /// assert_eq!(IdentitySource::Peer.resolve(&req), "10.0.0.1");
    /// assert_eq!(IdentitySource::ForwardedFor.resolve(&req), "203.0.113.9");
    /// ```
    pub fn resolve(self, request: &Request) -> String {
        if self == Self::ForwardedFor {
            let forwarded = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(client) = forwarded {
                return client.to_owned();
            }
        }

        request
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
    }
}

/// Per-request context handed to every middleware and to the endpoint.
#[derive(Debug)]
pub struct Context {
    request: Request,
    client: String,
}

impl Context {
    /// Creates a context, resolving the client from the peer address.
    pub fn new(request: Request) -> Self {
        let client = IdentitySource::Peer.resolve(&request);
        Self::with_client(request, client)
    }

    pub fn with_client(request: Request, client: impl Into<String>) -> Self {
        Self {
            request,
            client: client.into(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The identity admission control charges this request to.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}
