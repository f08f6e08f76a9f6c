//! Per-request context and the middleware chain engine.
//!
//! A [`Context`] lives for one connection cycle: it is pulled from the
//! engine's pool when a request begins, reset (but not destroyed) between
//! keep-alive requests, and returned to the pool when the connection ends.
//! While a request is being handled the context owns the connection, which is
//! what lets handlers stream request bodies and hijack the transport.
//!
//! Handlers form an ordered chain; every element but the last is middleware.
//! `next` advances the cursor and invokes the next handler — each middleware
//! continues the chain by calling `next().await`, and returning without
//! calling it skips everything after. `abort` parks the cursor past
//! [`ABORT_INDEX`] so no further handler can run.

use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::Notify;
use tracing::warn;

use crate::body::Body;
use crate::common::BoxFuture;
use crate::netio::Conn;
use crate::proto::h1::decode::Decoder;
use crate::request::Request;
use crate::response::Response;
use crate::route::Params;
use crate::server::ServerOptions;
use crate::tracer::TraceInfo;

/// Cursor value meaning "the chain is aborted".
///
/// Chains must stay strictly shorter than this.
pub const ABORT_INDEX: i8 = i8::MAX / 2;

/// A composable request handler.
pub trait HandlerFn: Send + Sync + 'static {
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, ()>;
}

impl<F> HandlerFn for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, ()> {
        (self)(cx)
    }
}

/// A shared, type-erased handler.
pub type Handler = Arc<dyn HandlerFn>;

/// An ordered handler chain; the last element is the main handler.
pub type HandlersChain = Vec<Handler>;

/// Wraps a handler function into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Takes sole ownership of a hijacked connection.
///
/// Returning the connection hands it back to the engine, which closes or
/// keeps it per `keep_hijacked_conns`; returning `None` means the handler
/// disposed of it itself.
pub type HijackHandler = Box<dyn FnOnce(Conn) -> BoxFuture<'static, Option<Conn>> + Send>;

/// Classification tag attached to collected handler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    Public,
    Private,
    Binding,
    Render,
}

#[derive(Debug)]
pub struct TaggedError {
    pub error: Box<dyn std::error::Error + Send + Sync>,
    pub tag: ErrorTag,
}

type Store = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Per-request state threaded through the handler chain.
pub struct Context {
    request: Request,
    response: Response,
    conn: Option<Conn>,
    remote: Option<SocketAddr>,
    params: Params,
    handlers: HandlersChain,
    index: i8,
    full_path: String,
    store: RwLock<Store>,
    errors: Vec<TaggedError>,
    hijack_handler: Option<HijackHandler>,
    body_decoder: Option<Decoder>,
    finished: Option<Arc<Notify>>,
    client_ip_resolver: Option<Arc<dyn Fn(&Context) -> String + Send + Sync>>,
    trace: TraceInfo,
    options: Arc<ServerOptions>,
}

impl Context {
    pub(crate) fn new(options: Arc<ServerOptions>) -> Context {
        Context {
            request: Request::default(),
            response: Response::default(),
            conn: None,
            remote: None,
            params: Params::new(),
            handlers: Vec::new(),
            index: -1,
            full_path: String::new(),
            store: RwLock::new(HashMap::new()),
            errors: Vec::new(),
            hijack_handler: None,
            body_decoder: None,
            finished: None,
            client_ip_resolver: None,
            trace: TraceInfo::disabled(),
            options,
        }
    }

    // ===== request / response =====

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = request;
    }

    /// Sets status and body in one go.
    pub fn string(&mut self, status: StatusCode, body: impl Into<Body>) {
        self.response.set_status(status);
        self.response.set_body(body);
    }

    // ===== connection =====

    pub(crate) fn attach_conn(&mut self, conn: Conn) {
        self.remote = conn.remote_addr();
        self.conn = Some(conn);
    }

    pub(crate) fn conn_mut(&mut self) -> Option<&mut Conn> {
        self.conn.as_mut()
    }

    pub(crate) fn take_conn(&mut self) -> Option<Conn> {
        self.conn.take()
    }

    /// The peer's socket address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    // ===== chain =====

    pub(crate) fn set_handlers(&mut self, handlers: HandlersChain, full_path: &str) {
        debug_assert!((handlers.len() as i64) < ABORT_INDEX as i64);
        self.handlers = handlers;
        self.full_path.clear();
        self.full_path.push_str(full_path);
    }

    /// The registered route pattern that matched, e.g. `/user/:id`.
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    /// Advances the chain cursor and runs the next handler.
    ///
    /// Middleware that wants the rest of the chain to run must await this;
    /// returning without calling it skips every later handler.
    pub async fn next(&mut self) {
        if self.index >= ABORT_INDEX {
            return;
        }
        self.index += 1;
        let i = self.index as usize;
        if i >= self.handlers.len() {
            return;
        }
        let h = self.handlers[i].clone();
        h.call(self).await;
    }

    /// Prevents any further handler from running.
    ///
    /// Does not interrupt the current handler.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    pub fn abort_with_status(&mut self, status: StatusCode) {
        self.response.set_status(status);
        self.abort();
    }

    pub fn abort_with_msg(&mut self, status: StatusCode, msg: impl Into<Body>) {
        self.response.set_status(status);
        self.response.set_body(msg);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    #[cfg(test)]
    pub(crate) fn set_handlers_for_test(&mut self, handlers: HandlersChain) {
        self.handlers = handlers;
    }

    // ===== params =====

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Value of the named path parameter, empty when absent.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).unwrap_or("")
    }

    // ===== scratch store =====

    /// Stores a request-scoped value. Concurrent readers are allowed; writers
    /// take the lock exclusively.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        store.get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }

    // ===== errors =====

    /// Appends a handler error with its classification tag.
    pub fn error(
        &mut self,
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        tag: ErrorTag,
    ) {
        self.errors.push(TaggedError {
            error: error.into(),
            tag,
        });
    }

    pub fn errors(&self) -> &[TaggedError] {
        &self.errors
    }

    // ===== body =====

    pub(crate) fn set_body_decoder(&mut self, decoder: Option<Decoder>) {
        self.body_decoder = decoder;
    }

    pub(crate) fn take_body_decoder(&mut self) -> Option<Decoder> {
        self.body_decoder.take()
    }

    /// Simultaneous access to the response and the connection, for the
    /// write path.
    pub(crate) fn response_and_conn(&mut self) -> crate::Result<(&mut Response, &mut Conn)> {
        match self.conn.as_mut() {
            Some(conn) => Ok((&mut self.response, conn)),
            None => Err(crate::Error::new_parse(crate::error::Parse::Internal)),
        }
    }

    /// Next chunk of a streamed request body, `None` when complete.
    pub async fn next_body_chunk(&mut self) -> crate::Result<Option<Bytes>> {
        let decoder = match self.body_decoder.as_mut() {
            Some(d) => d,
            None => return Ok(None),
        };
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };
        if decoder.is_done() {
            return Ok(None);
        }
        let chunk = decoder.decode(conn).await?;
        if chunk.is_empty() && decoder.is_done() {
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    /// The complete request body.
    ///
    /// In streaming mode this drains the rest of the stream into memory and
    /// caches it on the request.
    pub async fn body(&mut self) -> crate::Result<Bytes> {
        if let Some(bytes) = self.request.body().as_bytes() {
            return Ok(bytes.clone());
        }
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_body_chunk().await? {
            chunks.push(chunk);
        }
        let bytes = crate::common::buf::to_bytes(chunks);
        self.request.set_body(bytes.clone());
        Ok(bytes)
    }

    // ===== hijack =====

    /// Registers a handler that takes over the connection once the response
    /// has been written.
    pub fn hijack(&mut self, handler: HijackHandler) {
        self.hijack_handler = Some(handler);
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijack_handler.is_some()
    }

    pub(crate) fn take_hijack_handler(&mut self) -> Option<HijackHandler> {
        self.hijack_handler.take()
    }

    // ===== completion =====

    /// A signal fired when the request finishes. Created lazily.
    pub fn finished(&mut self) -> Arc<Notify> {
        self.finished
            .get_or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub(crate) fn signal_finished(&mut self) {
        if let Some(n) = self.finished.take() {
            n.notify_waiters();
        }
    }

    // ===== tracing =====

    pub fn trace_info(&self) -> &TraceInfo {
        &self.trace
    }

    pub fn trace_info_mut(&mut self) -> &mut TraceInfo {
        &mut self.trace
    }

    pub(crate) fn set_trace_info(&mut self, trace: TraceInfo) {
        self.trace = trace;
    }

    // ===== client IP =====

    /// Overrides the default client-IP resolution for this context.
    pub fn set_client_ip_resolver(
        &mut self,
        resolver: Arc<dyn Fn(&Context) -> String + Send + Sync>,
    ) {
        self.client_ip_resolver = Some(resolver);
    }

    /// Resolves the client IP.
    ///
    /// The socket address is trusted as-is unless it falls inside the
    /// configured trusted CIDRs, in which case the forwarded headers are
    /// walked right to left until the first untrusted address.
    pub fn client_ip(&self) -> String {
        if let Some(resolver) = &self.client_ip_resolver {
            return resolver(self);
        }
        let remote = match self.remote {
            Some(addr) => addr.ip(),
            None => return String::new(),
        };
        if !self.is_trusted_proxy(remote) {
            return remote.to_string();
        }
        for header in &self.options.forwarded_headers {
            for value in self.request.headers().get_all(header) {
                let Ok(value) = std::str::from_utf8(value) else {
                    continue;
                };
                for part in value.rsplit(',') {
                    let part = part.trim();
                    let Ok(ip) = part.parse::<IpAddr>() else {
                        warn!("unparsable forwarded address: {:?}", part);
                        continue;
                    };
                    if !self.is_trusted_proxy(ip) {
                        return ip.to_string();
                    }
                }
            }
        }
        remote.to_string()
    }

    fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.options
            .trusted_proxies
            .iter()
            .any(|net| net.contains(&ip))
    }

    // ===== lifecycle =====

    /// Snapshot detached from the connection, safe to use after the request
    /// completes. Its cursor is parked so it can never re-enter the chain.
    pub fn copy(&self) -> Context {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut req = Request::new(self.request.method().clone(), self.request.uri().clone());
        req.set_version(self.request.version());
        *req.headers_mut() = self.request.headers().clone();
        if let Some(bytes) = self.request.body().as_bytes() {
            req.set_body(bytes.clone());
        }
        Context {
            request: req,
            response: Response::new(),
            conn: None,
            remote: self.remote,
            params: self.params.clone(),
            handlers: Vec::new(),
            index: ABORT_INDEX,
            full_path: self.full_path.clone(),
            store: RwLock::new(store.clone()),
            errors: Vec::new(),
            hijack_handler: None,
            body_decoder: None,
            finished: None,
            client_ip_resolver: self.client_ip_resolver.clone(),
            trace: TraceInfo::disabled(),
            options: self.options.clone(),
        }
    }

    /// Reset between keep-alive requests on the same connection.
    pub(crate) fn reset_without_conn(&mut self) {
        self.signal_finished();
        self.request.reset();
        self.response.reset();
        self.params.clear();
        self.handlers.clear();
        self.index = -1;
        self.full_path.clear();
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.errors.clear();
        self.hijack_handler = None;
        self.body_decoder = None;
        self.client_ip_resolver = None;
        self.trace.flush_pending();
        self.trace = TraceInfo::disabled();
    }

    /// Full reset, on return to the context pool.
    pub(crate) fn reset(&mut self) {
        self.reset_without_conn();
        self.conn = None;
        self.remote = None;
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> i8 {
        self.index
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request", &self.request)
            .field("index", &self.index)
            .field("full_path", &self.full_path)
            .finish()
    }
}
