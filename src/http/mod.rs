//! HTTP/1.1 host primitives.
//!
//! The caching and admission layers only need a narrow view of HTTP: the
//! request [`Method`], path, query and headers going in, and a [`StatusCode`],
//! content type and body coming out. This module provides exactly that,
//! plus the wire parsing used by [`crate::server`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;

/// Returns `true` if `path` lies under `prefix` on a segment boundary.
///
/// `/products` covers `/products` and `/products/7` but not `/productsold`.
/// A prefix ending in `/` (including the root `/`) covers everything beneath it.
///
/// # Examples
///
/// ```
/// use tollgate::http::path_has_prefix;
///
/// assert!(path_has_prefix("/reports/daily", "/reports"));
/// assert!(!path_has_prefix("/reportsx", "/reports"));
/// assert!(path_has_prefix("/anything", "/"));
/// ```
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use tollgate::http::StatusCode;
///
/// let status = StatusCode::TooManyRequests;
/// assert_eq!(status.as_u16(), 429);
/// assert_eq!(status.canonical_reason(), "Too Many Requests");
/// assert!(!status.is_success());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,

    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,

    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    Conflict = 409,
    PayloadTooLarge = 413,
    UnprocessableEntity = 422,
    TooManyRequests = 429,

    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns `true` for 2xx codes. Only these are eligible for caching.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Returns `true` for 5xx codes.
    pub fn is_server_error(self) -> bool {
        self.as_u16() >= 500
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::TooManyRequests => "Too Many Requests",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

/// An HTTP request method.
///
/// Non-standard methods are captured in the `Custom` variant and are never
/// cacheable.
///
/// # Examples
///
/// ```
/// use tollgate::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert!(method.is_cacheable());
/// assert!(!Method::Post.is_cacheable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` if responses to this method may be memoized.
    ///
    /// Only GET and HEAD qualify: they are safe (RFC 9110 §9.2.1) and their
    /// responses depend solely on the request target.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }

    /// Returns `true` for methods that modify server state.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch | Self::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            other => Self::Custom(other.to_owned()),
        })
    }
}
