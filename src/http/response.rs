//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// The body is held as [`Bytes`] so cached responses can be replayed to many
/// clients without copying the payload.
///
/// # Examples
///
/// ```
/// use tollgate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Creates a response whose body is `value` serialized as JSON.
    ///
    /// Serialization of the admin payloads cannot fail in practice; if it
    /// ever does, a bare `500` is returned instead of panicking.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response");
                Self::new(StatusCode::InternalServerError)
            }
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header in-place, replacing any previous value. Intended for
    /// middleware that decorates a `Response` received from downstream.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        buf.put(format!("Content-Length: {content_length}\r\n\r\n").as_bytes());
        buf.put(self.body);

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn set_header_overrides_downstream_value() {
        let mut r = Response::new(StatusCode::Ok).header("X-Cache", "MISS");
        r.set_header("X-Cache", "HIT");
        assert_eq!(r.headers().get("x-cache"), Some("HIT"));
        assert_eq!(r.headers().len(), 1);
    }

    #[test]
    fn json_sets_content_type() {
        let r = Response::json(StatusCode::Ok, &serde_json::json!({ "removed": 3 }));
        assert_eq!(r.content_type(), Some("application/json"));
        assert_eq!(r.body_ref().as_ref(), br#"{"removed":3}"#);
    }

    #[test]
    fn no_body_no_content_type() {
        let s = to_string(Response::new(StatusCode::NoContent).into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let s = to_string(Response::new(StatusCode::Ok).keep_alive(false).into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn rejection_status_line() {
        let s = to_string(Response::new(StatusCode::TooManyRequests).into_bytes());
        assert!(s.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
    }
}
