//! The HTTP client: per-host pooled connections behind a middleware chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::BoxFuture;
use crate::request::Request;
use crate::response::Response;

pub(crate) mod host;
pub(crate) mod middleware;
pub(crate) mod pool;
pub mod retry;

pub use self::host::{Dialer, HostClient, TcpDialer};
pub use self::middleware::{DynEndpoint, Endpoint, Middleware};
pub use self::retry::RetryConfig;

/// How often the background cleaner sweeps the per-host maps.
const CLEANER_INTERVAL: Duration = Duration::from_secs(10);

/// Options shared by every host client an engine creates.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_conns_per_host: usize,
    pub max_idle_conn_duration: Duration,
    /// Total lifetime cap for a pooled connection.
    pub max_conn_duration: Option<Duration>,
    /// How long `Do` may wait for a free connection slot; `None` fails
    /// immediately with `NoFreeConns`.
    pub max_conn_wait_timeout: Option<Duration>,
    pub keep_alive: bool,
    pub disable_header_names_normalizing: bool,
    pub retry: RetryConfig,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            dial_timeout: Some(Duration::from_secs(1)),
            read_timeout: None,
            write_timeout: None,
            max_conns_per_host: 512,
            max_idle_conn_duration: Duration::from_secs(10),
            max_conn_duration: None,
            max_conn_wait_timeout: None,
            keep_alive: true,
            disable_header_names_normalizing: false,
            retry: RetryConfig::default(),
        }
    }
}

/// A shared, cloneable HTTP client.
///
/// Hosts are resolved lazily: the first request to a `{scheme, host}` pair
/// creates its pooled host client, and a background cleaner retires pairs
/// that have gone quiet.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: Arc<ClientOptions>,
    dialer: Arc<dyn Dialer>,
    tls_dialer: Option<Arc<dyn Dialer>>,
    http_hosts: Mutex<HashMap<String, Arc<HostClient>>>,
    https_hosts: Mutex<HashMap<String, Arc<HostClient>>>,
    cleaner_running: AtomicBool,
    middlewares: RwLock<Vec<Middleware>>,
    last_middleware: RwLock<Option<Middleware>>,
}

impl Default for Client {
    fn default() -> Client {
        Client::new(ClientOptions::default())
    }
}

impl Client {
    pub fn new(options: ClientOptions) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                options: Arc::new(options),
                dialer: Arc::new(TcpDialer),
                tls_dialer: None,
                http_hosts: Mutex::new(HashMap::new()),
                https_hosts: Mutex::new(HashMap::new()),
                cleaner_running: AtomicBool::new(false),
                middlewares: RwLock::new(Vec::new()),
                last_middleware: RwLock::new(None),
            }),
        }
    }

    /// Replaces the plain dialer, e.g. with one that binds a specific
    /// interface.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Client {
        let inner = Arc::get_mut(&mut self.inner);
        match inner {
            Some(inner) => inner.dialer = dialer,
            None => panic!("with_dialer must be called before the client is shared"),
        }
        self
    }

    /// Installs a TLS-handshaking dialer, enabling https targets.
    pub fn with_tls_dialer(mut self, dialer: Arc<dyn Dialer>) -> Client {
        let inner = Arc::get_mut(&mut self.inner);
        match inner {
            Some(inner) => inner.tls_dialer = Some(dialer),
            None => panic!("with_tls_dialer must be called before the client is shared"),
        }
        self
    }

    /// Appends a middleware around request execution.
    pub fn use_middleware(&self, mw: Middleware) {
        self.inner
            .middlewares
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(mw);
    }

    /// Installs the single innermost middleware, replacing any previous
    /// one so re-installation cannot double-wrap.
    pub fn set_last_middleware(&self, mw: Middleware) -> Option<Middleware> {
        self.inner
            .last_middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(mw)
    }

    /// Executes `req`, writing the outcome into `resp`.
    ///
    /// The request must carry an absolute URI or a Host header.
    pub async fn do_request(
        &self,
        req: &mut Request,
        resp: &mut Response,
    ) -> crate::Result<()> {
        let endpoint: DynEndpoint = Arc::new(CallHost {
            inner: self.inner.clone(),
        });
        let chained = {
            let mws = self
                .inner
                .middlewares
                .read()
                .unwrap_or_else(|e| e.into_inner());
            let last = self
                .inner
                .last_middleware
                .read()
                .unwrap_or_else(|e| e.into_inner());
            middleware::chain(&mws, last.as_ref(), endpoint)
        };
        chained.call(req, resp).await
    }

    /// Executes `req` with a caller-side timeout.
    ///
    /// An elapsed timeout returns control to the caller while the exchange
    /// may run to completion in the background; its response is discarded.
    pub async fn do_timeout(
        &self,
        mut req: Request,
        timeout: Duration,
    ) -> crate::Result<Response> {
        let client = self.clone();
        let task = tokio::spawn(async move {
            let mut resp = Response::new();
            client.do_request(&mut req, &mut resp).await.map(|_| resp)
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(crate::Error::new_canceled().with(join_err)),
            Err(_elapsed) => Err(crate::Error::new_timeout()),
        }
    }

    /// Like [`do_timeout`](Client::do_timeout) with an absolute deadline.
    pub async fn do_deadline(
        &self,
        req: Request,
        deadline: Instant,
    ) -> crate::Result<Response> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.do_timeout(req, timeout).await
    }

    /// Convenience GET of an absolute URL.
    pub async fn get(&self, url: &str) -> crate::Result<Response> {
        let uri: http::Uri = url
            .parse()
            .map_err(|_| crate::Error::new_parse(crate::error::Parse::Uri))?;
        let mut req = Request::new(http::Method::GET, uri);
        let mut resp = Response::new();
        self.do_request(&mut req, &mut resp).await?;
        Ok(resp)
    }

    /// Number of live per-host clients across both scheme maps.
    pub fn host_client_count(&self) -> usize {
        let http = self
            .inner
            .http_hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let https = self
            .inner
            .https_hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        http + https
    }
}

/// The terminal endpoint: resolve the host client, delegate to it.
struct CallHost {
    inner: Arc<ClientInner>,
}

impl Endpoint for CallHost {
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        resp: &'a mut Response,
    ) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(async move {
            let host_client = self.inner.resolve_host_client(req)?;
            host_client.do_request(req, resp).await
        })
    }
}

impl ClientInner {
    /// Looks up or creates the host client for the request's target.
    fn resolve_host_client(
        self: &Arc<ClientInner>,
        req: &Request,
    ) -> crate::Result<Arc<HostClient>> {
        let (scheme, host) = match req.uri().authority() {
            Some(authority) => (
                req.uri().scheme_str().unwrap_or("http").to_owned(),
                authority.as_str().to_owned(),
            ),
            None => {
                let host = req.host().unwrap_or("").to_owned();
                if host.is_empty() {
                    return Err(crate::Error::new_user_missing_host());
                }
                ("http".to_owned(), host)
            }
        };

        let (map, dialer) = match scheme.as_str() {
            "http" => (&self.http_hosts, self.dialer.clone()),
            "https" => match &self.tls_dialer {
                Some(tls) => (&self.https_hosts, tls.clone()),
                None => {
                    return Err(crate::Error::new_user_unsupported_scheme()
                        .with(format!("no TLS dialer installed for {:?}", host)))
                }
            },
            other => {
                return Err(crate::Error::new_user_unsupported_scheme()
                    .with(format!("unsupported scheme {:?}", other)))
            }
        };

        let mut hosts = map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = hosts.get(&host) {
            return Ok(existing.clone());
        }
        debug!("creating host client for {}://{}", scheme, host);
        let client = Arc::new(HostClient::new(
            scheme,
            host.clone(),
            self.options.clone(),
            dialer,
        ));
        hosts.insert(host, client.clone());
        drop(hosts);
        self.start_cleaner();
        Ok(client)
    }

    /// Spawns the 10-second sweeper on first host creation. It retires host
    /// clients with no pooled or pending connections and exits once both
    /// maps are empty.
    fn start_cleaner(self: &Arc<ClientInner>) {
        if self
            .cleaner_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak: Weak<ClientInner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut empty = true;
                for map in [&inner.http_hosts, &inner.https_hosts] {
                    let mut hosts = map.lock().unwrap_or_else(|e| e.into_inner());
                    hosts.retain(|host, client| {
                        client.evict_expired();
                        let keep = !client.should_remove();
                        if !keep {
                            trace!("removing idle host client for {}", host);
                        }
                        keep
                    });
                    empty &= hosts.is_empty();
                }
                if empty {
                    inner.cleaner_running.store(false, Ordering::Release);
                    return;
                }
            }
        });
    }
}
