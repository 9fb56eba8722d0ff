//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP/1.1 request as seen by the middleware pipeline.
///
/// Requests either come off the wire through [`Request::parse`] or are built
/// programmatically with [`Request::new`] by hosts that do their own parsing.
/// Query parameters are kept as an ordered list of decoded pairs so repeated
/// keys (`?tag=a&tag=b`) survive into the cache fingerprint.
///
/// # Examples
///
/// ```
/// use tollgate::http::Request;
///
/// let raw = b"GET /products?limit=10&sort=name HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/products");
/// assert_eq!(request.query_param("limit"), Some("10"));
/// assert_eq!(request.query_pairs().len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    query_pairs: Vec<(String, String)>,
    body: Bytes,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Builds a request from a method and a request target (`/path?query`).
    ///
    /// The request defaults to HTTP/1.1 with no headers, no body and no peer
    /// address.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        let query_pairs = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            query_pairs,
            body: Bytes::new(),
            peer_addr: None,
        }
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf`. The body held by the returned request is everything after the
    /// header terminator; the server trims it to `Content-Length`.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the headers.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let method: Method = match method.parse() {
            Ok(m) => m,
            Err(never) => match never {},
        };

        let mut request = Self::new(method, target);
        request.version = version;
        request.headers = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                request.headers.insert(header.name, value);
            }
        }
        request.body = Bytes::copy_from_slice(&buf[body_offset..]);

        Ok((request, body_offset))
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Attaches the address of the connected peer.
    #[must_use]
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub(crate) fn truncate_body(&mut self, len: usize) {
        if self.body.len() > len {
            self.body.truncate(len);
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the decoded query parameters in the order they appeared.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    /// Returns the first value of a decoded query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the address of the peer that sent this request, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

/// Parses `key=value&key2=value2` into decoded pairs.
///
/// `+` decodes to a space before percent-decoding. Segments that are not
/// valid UTF-8 after decoding are kept verbatim rather than dropped.
fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
