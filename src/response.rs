//! HTTP responses.

use std::fmt;

use bytes::Bytes;
use http::{StatusCode, Version};

use crate::body::Body;
use crate::common::BoxFuture;
use crate::headers::{self, HeaderMap};
use crate::netio::Conn;

/// Replaces the default response-write path when installed on a response.
///
/// The server loop hands the writer the response and the connection, then
/// calls [`finalize`](ResponseWriter::finalize) once the handler chain is
/// done. Chunked trailers, SSE-style incremental flushing, and similar
/// surfaces hang off this seam.
pub trait ResponseWriter: Send {
    fn write_response<'a>(
        &'a mut self,
        resp: &'a mut Response,
        conn: &'a mut Conn,
    ) -> BoxFuture<'a, crate::Result<()>>;

    /// Called exactly once by the server loop after the handler chain ends.
    fn finalize<'a>(&'a mut self, conn: &'a mut Conn) -> BoxFuture<'a, crate::Result<()>>;
}

/// An HTTP response: status line, headers, body.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
    hijack_writer: Option<Box<dyn ResponseWriter>>,
}

impl Response {
    pub fn new() -> Response {
        Response {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            hijack_writer: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Buffered body bytes, when the body is buffered.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_bytes()
    }

    pub fn set_content_type(&mut self, value: &str) {
        self.headers.set(headers::CONTENT_TYPE, value.to_owned());
    }

    /// Installs a hijack writer, replacing the default write path.
    pub fn set_hijack_writer(&mut self, writer: Box<dyn ResponseWriter>) {
        self.hijack_writer = Some(writer);
    }

    pub fn has_hijack_writer(&self) -> bool {
        self.hijack_writer.is_some()
    }

    pub(crate) fn take_hijack_writer(&mut self) -> Option<Box<dyn ResponseWriter>> {
        self.hijack_writer.take()
    }

    /// Whether this status forbids a message body.
    pub(crate) fn must_skip_body(&self) -> bool {
        matches!(
            self.status,
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
        ) || self.status.is_informational()
    }

    pub(crate) fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body = Body::Empty;
        self.hijack_writer = None;
    }
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_forbidden_statuses() {
        let mut resp = Response::new();
        for code in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED, StatusCode::CONTINUE] {
            resp.set_status(code);
            assert!(resp.must_skip_body(), "{} must not carry a body", code);
        }
        resp.set_status(StatusCode::OK);
        assert!(!resp.must_skip_body());
    }

    #[test]
    fn reset_clears_hijack_writer() {
        struct Nop;
        impl ResponseWriter for Nop {
            fn write_response<'a>(
                &'a mut self,
                _: &'a mut Response,
                _: &'a mut Conn,
            ) -> BoxFuture<'a, crate::Result<()>> {
                Box::pin(async { Ok(()) })
            }
            fn finalize<'a>(&'a mut self, _: &'a mut Conn) -> BoxFuture<'a, crate::Result<()>> {
                Box::pin(async { Ok(()) })
            }
        }

        let mut resp = Response::new();
        resp.set_hijack_writer(Box::new(Nop));
        assert!(resp.has_hijack_writer());
        resp.reset();
        assert!(!resp.has_hijack_writer());
    }
}
