//! The dispatch root: route registration, request dispatch, lifecycle.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::FutureExt;
use http::{Method, StatusCode, Version};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::common::BoxFuture;
use crate::context::{handler, Context, Handler, HandlersChain};
use crate::netio::Conn;
use crate::protocol::{ProtocolServer, H2C_PREFACE, PROTOCOL_HTTP1};
use crate::proto::h1::serve::Http1Server;
use crate::request::Request;
use crate::route::{Params, RouteMatch, Router};
use crate::server::{ServerOptions, Transport};
use crate::tracer::TraceInfo;

const DEFAULT_400_BODY: &[u8] = b"400 bad request";
const DEFAULT_404_BODY: &[u8] = b"404 page not found";
const DEFAULT_405_BODY: &[u8] = b"405 method not allowed";

/// Engine lifecycle states.
const STATE_NEW: u32 = 0;
const STATE_INITIALIZED: u32 = 1;
const STATE_RUNNING: u32 = 2;
const STATE_SHUTDOWN: u32 = 3;
const STATE_CLOSED: u32 = 4;

/// Decides whether a request's `Expect: 100-continue` is honored.
pub type ContinueHandler = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

const CTX_POOL_LIMIT: usize = 256;

/// The server engine: router, middleware, protocol registry, lifecycle.
///
/// Routes and options are mutable until [`run`](Engine::run); after the
/// engine transitions to running the tree is immutable and shared across
/// connection tasks.
pub struct Engine {
    options: Arc<ServerOptions>,
    router: Router,
    middlewares: HandlersChain,
    no_route: HandlersChain,
    no_method: HandlersChain,
    panic_handler: Option<Handler>,
    continue_handler: Option<ContinueHandler>,
    protocols: HashMap<&'static str, Arc<dyn ProtocolServer>>,
    ctx_pool: Mutex<Vec<Context>>,
    state: AtomicU32,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
    shutdown_tx: OnceLock<watch::Sender<bool>>,
    shutdown_rx: OnceLock<watch::Receiver<bool>>,
    drained: Arc<Notify>,
    local_addr: OnceLock<std::net::SocketAddr>,
    on_accept: Option<crate::server::OnAccept>,
    on_connect: Option<crate::server::OnConnect>,
}

impl Engine {
    pub fn new(options: ServerOptions) -> Engine {
        fn not_found(cx: &mut Context) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                cx.response_mut().set_status(StatusCode::NOT_FOUND);
                cx.response_mut().set_body(DEFAULT_404_BODY);
            })
        }
        fn not_allowed(cx: &mut Context) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                cx.response_mut().set_status(StatusCode::METHOD_NOT_ALLOWED);
                cx.response_mut().set_body(DEFAULT_405_BODY);
            })
        }
        Engine {
            options: Arc::new(options),
            router: Router::new(),
            middlewares: Vec::new(),
            no_route: vec![handler(not_found)],
            no_method: vec![handler(not_allowed)],
            panic_handler: None,
            continue_handler: None,
            protocols: HashMap::new(),
            ctx_pool: Mutex::new(Vec::new()),
            state: AtomicU32::new(STATE_NEW),
            shutdown_hooks: Mutex::new(Vec::new()),
            shutdown_tx: OnceLock::new(),
            shutdown_rx: OnceLock::new(),
            drained: Arc::new(Notify::new()),
            local_addr: OnceLock::new(),
            on_accept: None,
            on_connect: None,
        }
    }

    pub fn options(&self) -> &Arc<ServerOptions> {
        &self.options
    }

    // ===== registration =====

    fn assert_mutable(&self) {
        assert!(
            self.state.load(Ordering::Acquire) < STATE_RUNNING,
            "routes and options are immutable once the engine is running"
        );
    }

    /// Appends middleware run before every subsequently registered route.
    pub fn use_middleware(&mut self, middleware: Handler) -> &mut Engine {
        self.assert_mutable();
        self.middlewares.push(middleware);
        self
    }

    /// Registers a handler chain for `method` on `path`.
    pub fn handle(&mut self, method: Method, path: &str, handlers: HandlersChain) {
        self.assert_mutable();
        let mut chain = self.middlewares.clone();
        chain.extend(handlers);
        self.router.add_route(method, path, chain);
    }

    pub fn get(&mut self, path: &str, h: Handler) {
        self.handle(Method::GET, path, vec![h]);
    }

    pub fn post(&mut self, path: &str, h: Handler) {
        self.handle(Method::POST, path, vec![h]);
    }

    pub fn put(&mut self, path: &str, h: Handler) {
        self.handle(Method::PUT, path, vec![h]);
    }

    pub fn patch(&mut self, path: &str, h: Handler) {
        self.handle(Method::PATCH, path, vec![h]);
    }

    pub fn delete(&mut self, path: &str, h: Handler) {
        self.handle(Method::DELETE, path, vec![h]);
    }

    pub fn head(&mut self, path: &str, h: Handler) {
        self.handle(Method::HEAD, path, vec![h]);
    }

    pub fn options_method(&mut self, path: &str, h: Handler) {
        self.handle(Method::OPTIONS, path, vec![h]);
    }

    pub fn connect(&mut self, path: &str, h: Handler) {
        self.handle(Method::CONNECT, path, vec![h]);
    }

    pub fn trace_method(&mut self, path: &str, h: Handler) {
        self.handle(Method::TRACE, path, vec![h]);
    }

    /// Registers `h` for all nine methods.
    pub fn any(&mut self, path: &str, h: Handler) {
        for method in [
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
            Method::CONNECT,
            Method::TRACE,
        ] {
            self.handle(method, path, vec![h.clone()]);
        }
    }

    /// Opens a registration group sharing a path prefix and middleware.
    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        RouteGroup {
            engine: self,
            base: prefix.trim_end_matches('/').to_owned(),
            middlewares: Vec::new(),
        }
    }

    /// Replaces the no-route (404) chain.
    pub fn no_route(&mut self, handlers: HandlersChain) {
        self.assert_mutable();
        self.no_route = handlers;
    }

    /// Replaces the no-method (405) chain.
    pub fn no_method(&mut self, handlers: HandlersChain) {
        self.assert_mutable();
        self.no_method = handlers;
    }

    /// Installs a recovery handler invoked when a route handler panics.
    pub fn set_panic_handler(&mut self, h: Handler) {
        self.assert_mutable();
        self.panic_handler = Some(h);
    }

    pub fn set_continue_handler(&mut self, h: ContinueHandler) {
        self.assert_mutable();
        self.continue_handler = Some(h);
    }

    pub(crate) fn continue_handler(&self) -> Option<&ContinueHandler> {
        self.continue_handler.as_ref()
    }

    /// Registers an alternative protocol server, keyed by its ALPN name.
    pub fn register_protocol(&mut self, server: Arc<dyn ProtocolServer>) {
        self.assert_mutable();
        self.protocols.insert(server.protocol(), server);
    }

    /// Installs a raw-socket filter run right after each accept.
    pub fn set_on_accept(&mut self, hook: crate::server::OnAccept) {
        self.assert_mutable();
        self.on_accept = Some(hook);
    }

    /// Installs a connection filter run once the connection is wrapped.
    pub fn set_on_connect(&mut self, hook: crate::server::OnConnect) {
        self.assert_mutable();
        self.on_connect = Some(hook);
    }

    /// Adds a hook run concurrently with the others during graceful
    /// shutdown.
    pub fn on_shutdown(&mut self, hook: impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static) {
        self.shutdown_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(hook));
    }

    // ===== context pool =====

    pub(crate) fn acquire_context(&self) -> Context {
        let mut cx = {
            let mut pool = self.ctx_pool.lock().unwrap_or_else(|e| e.into_inner());
            pool.pop()
        }
        .unwrap_or_else(|| Context::new(self.options.clone()));
        *cx.params_mut() = Params::with_capacity(self.router.max_params());
        if self.options.enable_trace {
            cx.set_trace_info(TraceInfo::new(self.options.trace_level, true));
        }
        cx
    }

    pub(crate) fn release_context(&self, mut cx: Context) {
        cx.reset();
        let mut pool = self.ctx_pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < CTX_POOL_LIMIT {
            pool.push(cx);
        }
    }

    // ===== dispatch =====

    /// Routes one request and runs its handler chain.
    pub async fn serve_http(&self, cx: &mut Context) {
        let req = cx.request();
        if req.version() == Version::HTTP_11
            && req.host().is_none()
            && req.method() != Method::CONNECT
        {
            cx.response_mut().set_status(StatusCode::BAD_REQUEST);
            cx.response_mut().set_body(DEFAULT_400_BODY);
            return;
        }

        let use_raw = self.options.use_raw_path;
        let mut path = if use_raw {
            String::from_utf8_lossy(cx.request().raw_path()).into_owned()
        } else {
            cx.request().path().to_owned()
        };
        if self.options.remove_extra_slash {
            path = collapse_slashes(&path);
        }
        if path.is_empty() || !path.starts_with('/') {
            cx.response_mut().set_status(StatusCode::BAD_REQUEST);
            cx.response_mut().set_body(DEFAULT_400_BODY);
            return;
        }

        let method = cx.request().method().clone();
        let RouteMatch { route, values, tsr } = self.router.find(&method, &path);

        if let Some(route) = route {
            Router::capture(&route, values, use_raw, cx.params_mut());
            cx.set_handlers(route.handlers.clone(), &route.full_path);
            self.run_chain(cx).await;
            return;
        }

        if method != Method::CONNECT && path != "/" {
            if tsr && self.options.redirect_trailing_slash {
                let target = if path.ends_with('/') {
                    path[..path.len() - 1].to_owned()
                } else {
                    let mut p = path.clone();
                    p.push('/');
                    p
                };
                self.redirect(cx, &method, target);
                return;
            }
            if self.options.redirect_fixed_path {
                let fixed = self.router.find_case_insensitive(
                    &method,
                    &path,
                    self.options.redirect_trailing_slash,
                );
                if let Some(fixed) = fixed {
                    self.redirect(cx, &method, fixed);
                    return;
                }
            }
        }

        if self.options.handle_method_not_allowed
            && self.router.allows_other_method(&method, &path)
        {
            debug!("no handler for {} {}, found other methods", method, path);
            cx.set_handlers(self.no_method.clone(), "");
            self.run_chain(cx).await;
            return;
        }

        cx.set_handlers(self.no_route.clone(), "");
        self.run_chain(cx).await;
    }

    fn redirect(&self, cx: &mut Context, method: &Method, target: String) {
        let status = if *method == Method::GET {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };
        debug!("redirecting to {}", target);
        cx.response_mut().set_status(status);
        cx.response_mut()
            .headers_mut()
            .set(crate::headers::LOCATION, target);
    }

    async fn run_chain(&self, cx: &mut Context) {
        match &self.panic_handler {
            Some(recover) => {
                let panicked = AssertUnwindSafe(cx.next()).catch_unwind().await.is_err();
                if panicked {
                    error!("handler panicked, running recovery handler");
                    recover.call(cx).await;
                }
            }
            None => cx.next().await,
        }
    }

    // ===== lifecycle =====

    fn init(&mut self) {
        if !self.protocols.contains_key(PROTOCOL_HTTP1) {
            self.protocols
                .insert(PROTOCOL_HTTP1, Arc::new(Http1Server::new()));
        }
        self.state.store(STATE_INITIALIZED, Ordering::Release);
    }

    /// ALPN identifiers of every loaded protocol server.
    pub fn alpn_protocols(&self) -> Vec<&'static str> {
        self.protocols.keys().copied().collect()
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_SHUTDOWN
    }

    /// Freezes registration and produces the shared engine handle.
    pub fn into_shared(mut self) -> Arc<Engine> {
        self.init();
        let (tx, rx) = watch::channel(false);
        let _ = self.shutdown_tx.set(tx);
        let _ = self.shutdown_rx.set(rx);
        Arc::new(self)
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(self) -> crate::Result<()> {
        self.into_shared().serve().await
    }

    /// Serves a shared engine until shut down.
    pub async fn serve(self: &Arc<Engine>) -> crate::Result<()> {
        let rx = match self.shutdown_rx.get() {
            Some(rx) => rx.clone(),
            None => return Err(crate::Error::new_parse(crate::error::Parse::Internal)),
        };
        self.state.store(STATE_RUNNING, Ordering::Release);
        info!("server listening on {}", self.options.address);
        let mut transport = Transport::new(self.options.clone());
        if let Some(hook) = self.on_accept.clone() {
            transport.set_on_accept(hook);
        }
        if let Some(hook) = self.on_connect.clone() {
            transport.set_on_connect(hook);
        }
        let result = transport.listen_and_serve(self.clone(), rx).await;
        self.drained.notify_waiters();
        result
    }

    /// The listener's bound address, available once serving has started.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr.get().copied()
    }

    pub(crate) fn set_local_addr(&self, addr: std::net::SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    /// Picks a protocol server for a fresh connection and serves it.
    ///
    /// Selection order: the ALPN-negotiated protocol when the handshake
    /// produced one, the H2C preface when sniffing is enabled, HTTP/1.1
    /// otherwise.
    pub(crate) async fn serve_connection(&self, mut conn: Conn) -> crate::Result<()> {
        if let Some(proto) = conn.negotiated_protocol().map(str::to_owned) {
            if let Some(server) = self.protocols.get(proto.as_str()) {
                return server.serve(self, conn).await;
            }
            warn!("no protocol server registered for {:?}", proto);
        }
        if self.options.h2c {
            if let Some(h2) = self.protocols.get("h2") {
                if let Ok(preface) = conn.peek(H2C_PREFACE.len()).await {
                    if preface == H2C_PREFACE {
                        debug!("h2c preface detected");
                        return h2.serve(self, conn).await;
                    }
                }
            }
        }
        match self.protocols.get(PROTOCOL_HTTP1) {
            Some(h1) => h1.serve(self, conn).await,
            None => Err(crate::Error::new_parse(crate::error::Parse::Internal)),
        }
    }

    /// Graceful shutdown: runs user hooks concurrently, stops the accept
    /// loop, and waits out in-flight connections, all bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.state.store(STATE_SHUTDOWN, Ordering::Release);
        let hooks: Vec<ShutdownHook> = std::mem::take(
            &mut *self
                .shutdown_hooks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if !hooks.is_empty() {
            let joined = futures_util::future::join_all(hooks.into_iter().map(|h| h()));
            if tokio::time::timeout(timeout, joined).await.is_err() {
                warn!("shutdown hooks did not finish within {:?}", timeout);
            }
        }
        if let Some(tx) = self.shutdown_tx.get() {
            let _ = tx.send(true);
        }
        let _ = tokio::time::timeout(timeout, self.drained.notified()).await;
        self.state.store(STATE_CLOSED, Ordering::Release);
        info!("server closed");
    }

    /// Graceful shutdown bounded by the configured `shutdown_timeout`.
    pub async fn graceful_shutdown(&self) {
        self.shutdown(self.options.shutdown_timeout).await;
    }

    /// Zero-timeout shutdown.
    pub async fn close(&self) {
        self.shutdown(Duration::ZERO).await;
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

/// A registration scope sharing a path prefix and extra middleware.
pub struct RouteGroup<'e> {
    engine: &'e mut Engine,
    base: String,
    middlewares: HandlersChain,
}

impl<'e> RouteGroup<'e> {
    pub fn use_middleware(&mut self, middleware: Handler) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn group(&mut self, prefix: &str) -> RouteGroup<'_> {
        let base = self.join(prefix);
        RouteGroup {
            engine: &mut *self.engine,
            base: base.trim_end_matches('/').to_owned(),
            middlewares: self.middlewares.clone(),
        }
    }

    fn join(&self, path: &str) -> String {
        let mut full = self.base.clone();
        if !path.starts_with('/') {
            full.push('/');
        }
        full.push_str(path);
        if full.is_empty() {
            full.push('/');
        }
        full
    }

    pub fn handle(&mut self, method: Method, path: &str, handlers: HandlersChain) {
        let full = self.join(path);
        let mut chain = self.middlewares.clone();
        chain.extend(handlers);
        self.engine.handle(method, &full, chain);
    }

    pub fn get(&mut self, path: &str, h: Handler) {
        self.handle(Method::GET, path, vec![h]);
    }

    pub fn post(&mut self, path: &str, h: Handler) {
        self.handle(Method::POST, path, vec![h]);
    }

    pub fn put(&mut self, path: &str, h: Handler) {
        self.handle(Method::PUT, path, vec![h]);
    }

    pub fn delete(&mut self, path: &str, h: Handler) {
        self.handle(Method::DELETE, path, vec![h]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_path(cx: &mut Context) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let path = cx.full_path().to_owned();
            cx.string(StatusCode::OK, path);
        })
    }

    fn engine_with(routes: &[(&str, Method)]) -> Engine {
        let mut engine = Engine::new(ServerOptions::default());
        for (path, method) in routes {
            engine.handle(method.clone(), path, vec![handler(echo_path)]);
        }
        engine
    }

    fn request_ctx(engine: &Engine, method: Method, path: &str) -> Context {
        let mut cx = engine.acquire_context();
        let uri: http::Uri = path.parse().unwrap();
        let mut req = Request::new(method, uri);
        req.set_host("test.local");
        cx.set_request(req);
        cx
    }

    #[tokio::test]
    async fn dispatch_hits_registered_route() {
        let engine = engine_with(&[("/test", Method::GET)]);
        let mut cx = request_ctx(&engine, Method::GET, "/test");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::OK);
        assert_eq!(cx.response().body_bytes().unwrap().as_ref(), b"/test");
    }

    #[tokio::test]
    async fn missing_route_is_404_with_default_body() {
        let engine = engine_with(&[("/test", Method::GET)]);
        let mut cx = request_ctx(&engine, Method::GET, "/nope");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            cx.response().body_bytes().unwrap().as_ref(),
            DEFAULT_404_BODY
        );
    }

    #[tokio::test]
    async fn missing_host_on_http11_is_400() {
        let engine = engine_with(&[("/test", Method::GET)]);
        let mut cx = engine.acquire_context();
        cx.set_request(Request::new(Method::GET, "/test".parse().unwrap()));
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn trailing_slash_redirects_get_with_301() {
        let engine = engine_with(&[("/foo", Method::GET)]);
        let mut cx = request_ctx(&engine, Method::GET, "/foo/");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(cx.response().headers().get_str("Location"), "/foo");
    }

    #[tokio::test]
    async fn trailing_slash_redirects_post_with_307() {
        let engine = engine_with(&[("/foo/", Method::POST)]);
        let mut cx = request_ctx(&engine, Method::POST, "/foo");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(cx.response().headers().get_str("Location"), "/foo/");
    }

    #[tokio::test]
    async fn method_not_allowed_when_enabled() {
        let mut opts = ServerOptions::default();
        opts.handle_method_not_allowed = true;
        let mut engine = Engine::new(opts);
        engine.get("/x", handler(echo_path));
        let mut cx = request_ctx(&engine, Method::POST, "/x");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn fixed_path_redirect_when_enabled() {
        let mut opts = ServerOptions::default();
        opts.redirect_fixed_path = true;
        let mut engine = Engine::new(opts);
        engine.get("/Docs/readme", handler(echo_path));
        let mut cx = request_ctx(&engine, Method::GET, "/docs/README");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(cx.response().headers().get_str("Location"), "/Docs/readme");
    }

    #[tokio::test]
    async fn group_prefixes_and_middleware_compose() {
        fn tagger(cx: &mut Context) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                cx.set("tagged", true);
                cx.next().await;
            })
        }
        let mut engine = Engine::new(ServerOptions::default());
        {
            let mut api = engine.group("/api");
            api.use_middleware(handler(tagger));
            let mut v1 = api.group("/v1");
            v1.get("/users/:id", handler(echo_path));
        }
        let mut cx = request_ctx(&engine, Method::GET, "/api/v1/users/7");
        engine.serve_http(&mut cx).await;
        assert_eq!(cx.response().status(), StatusCode::OK);
        assert_eq!(
            cx.response().body_bytes().unwrap().as_ref(),
            b"/api/v1/users/:id"
        );
        assert_eq!(cx.param("id"), "7");
        assert_eq!(cx.get::<bool>("tagged").as_deref(), Some(&true));
    }

    #[tokio::test]
    async fn panic_handler_recovers() {
        fn boom(_cx: &mut Context) -> BoxFuture<'_, ()> {
            Box::pin(async move { panic!("kaboom") })
        }
        fn recover(cx: &mut Context) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                cx.response_mut()
                    .set_status(StatusCode::INTERNAL_SERVER_ERROR);
            })
        }
        let mut engine = Engine::new(ServerOptions::default());
        engine.set_panic_handler(handler(recover));
        engine.get("/boom", handler(boom));
        let mut cx = request_ctx(&engine, Method::GET, "/boom");
        engine.serve_http(&mut cx).await;
        assert_eq!(
            cx.response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn collapse_extra_slashes() {
        assert_eq!(collapse_slashes("//a///b/"), "/a/b/");
        assert_eq!(collapse_slashes("/a/b"), "/a/b");
    }

    #[test]
    fn context_pool_reuses() {
        let engine = engine_with(&[("/a/:b", Method::GET)]);
        let cx = engine.acquire_context();
        engine.release_context(cx);
        let cx2 = engine.acquire_context();
        assert!(!cx2.is_aborted());
        assert_eq!(cx2.params().len(), 0);
    }
}
