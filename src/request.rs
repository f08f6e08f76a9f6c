//! HTTP requests.

use std::fmt;

use bytes::Bytes;
use http::{Method, Uri, Version};

use crate::body::Body;
use crate::headers::{self, HeaderMap};

/// An HTTP request: head plus body.
///
/// On the server side requests are produced by the parser and carry the
/// preserved wire bytes of the head. On the client side they are built by the
/// caller and must name a target — either an absolute URI or a Host header
/// plus request URI.
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Body,
    /// Request-target exactly as received, before any normalization.
    raw_path: Bytes,
    /// The full head as it appeared on the wire. Empty for locally built
    /// requests.
    raw_head: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Request {
        let raw_path = Bytes::copy_from_slice(uri.path().as_bytes());
        Request {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Body::Empty,
            raw_path,
            raw_head: Bytes::new(),
        }
    }

    pub fn get(uri: impl TryInto<Uri>) -> Request {
        let uri = uri.try_into().unwrap_or_else(|_| Uri::from_static("/"));
        Request::new(Method::GET, uri)
    }

    pub(crate) fn from_parse(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        raw_path: Bytes,
        raw_head: Bytes,
    ) -> Request {
        Request {
            method,
            uri,
            version,
            headers,
            body: Body::Empty,
            raw_path,
            raw_head,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.raw_path = Bytes::copy_from_slice(uri.path().as_bytes());
        self.uri = uri;
    }

    /// The normalized, still-escaped path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The request-target path bytes exactly as received.
    pub fn raw_path(&self) -> &[u8] {
        &self.raw_path
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// First value of the named query argument, percent-decoded.
    pub fn query_value(&self, name: &str) -> Option<String> {
        for pair in self.query().split('&') {
            let mut it = pair.splitn(2, '=');
            let k = it.next().unwrap_or("");
            if k == name {
                let v = it.next().unwrap_or("");
                return Some(
                    percent_encoding::percent_decode_str(v)
                        .decode_utf8_lossy()
                        .into_owned(),
                );
            }
        }
        None
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

    /// The full head as it appeared on the wire.
    pub fn raw_head(&self) -> &[u8] {
        &self.raw_head
    }

    /// The target host: the URI authority when absolute, else the Host
    /// header.
    pub fn host(&self) -> Option<&str> {
        if let Some(authority) = self.uri.authority() {
            return Some(authority.as_str());
        }
        let host = self.headers.get_str(headers::HOST);
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    pub fn set_host(&mut self, host: &str) {
        self.headers.set(headers::HOST, host.to_owned());
    }

    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    /// Whether the request asks for a `100 Continue` probe before the body.
    pub(crate) fn expects_continue(&self) -> bool {
        self.headers
            .get(headers::EXPECT)
            .map(|v| v.eq_ignore_ascii_case(b"100-continue"))
            .unwrap_or(false)
    }

    /// The keep-alive decision this request's headers imply.
    pub(crate) fn wants_keep_alive(&self) -> bool {
        if self.headers.connection_has("close") {
            return false;
        }
        match self.version {
            Version::HTTP_11 => true,
            _ => self.headers.connection_has("keep-alive"),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.method = Method::GET;
        self.uri = Uri::from_static("/");
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body = Body::Empty;
        self.raw_path = Bytes::new();
        self.raw_head = Bytes::new();
    }
}

impl Default for Request {
    fn default() -> Request {
        Request::new(Method::GET, Uri::from_static("/"))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}
