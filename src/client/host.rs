//! Per-host HTTP/1 client with its pooled connections.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::body::Body;
use crate::common::BoxFuture;
use crate::netio::Conn;
use crate::proto::h1;
use crate::request::Request;
use crate::response::Response;

use super::pool::ConnPool;
use super::retry::default_retry_if;
use super::ClientOptions;

/// Establishes raw connections to a dialed address.
///
/// The default implementation dials plain TCP; TLS-capable deployments plug
/// a handshaking dialer in here.
pub trait Dialer: Send + Sync + 'static {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, crate::Result<Conn>>;
}

/// The plain TCP dialer.
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, addr: &'a str) -> BoxFuture<'a, crate::Result<Conn>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(crate::Error::new_connect)?;
            let _ = stream.set_nodelay(true);
            let remote = stream.peer_addr().ok();
            let local = stream.local_addr().ok();
            Ok(Conn::new(stream).with_addrs(remote, local))
        })
    }
}

/// One host's client: a dialer plus a pool of idle connections, keyed by
/// `{scheme, host}` in the engine's maps.
pub struct HostClient {
    scheme: String,
    host: String,
    options: Arc<ClientOptions>,
    dialer: Arc<dyn Dialer>,
    pool: ConnPool,
}

impl HostClient {
    pub(crate) fn new(
        scheme: String,
        host: String,
        options: Arc<ClientOptions>,
        dialer: Arc<dyn Dialer>,
    ) -> HostClient {
        let pool = ConnPool::new(
            options.max_conns_per_host,
            options.max_idle_conn_duration,
            options.max_conn_duration,
        );
        HostClient {
            scheme,
            host,
            options,
            dialer,
            pool,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn dial_addr(&self) -> String {
        if self.host.contains(':') {
            return self.host.clone();
        }
        let port = if self.scheme == "https" { 443 } else { 80 };
        format!("{}:{}", self.host, port)
    }

    /// Executes `req`, retrying transient failures per the retry config.
    pub async fn do_request(
        &self,
        req: &mut Request,
        resp: &mut Response,
    ) -> crate::Result<()> {
        let retry = &self.options.retry;
        let mut attempts: u32 = 0;
        loop {
            match self.do_once(req, resp).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempts += 1;
                    if attempts >= retry.max_attempt_times {
                        return Err(err);
                    }
                    let retryable = match &retry.retry_if {
                        Some(f) => f(req, &err),
                        None => default_retry_if(req, &err),
                    };
                    // Reader bodies were consumed by the failed attempt and
                    // cannot be replayed.
                    let replayable =
                        matches!(req.body(), Body::Empty | Body::Bytes(_));
                    if !retryable || !replayable {
                        return Err(err);
                    }
                    let delay = retry.delay_for(attempts - 1);
                    debug!(
                        "retrying request to {} in {:?} (attempt {})",
                        self.host, delay, attempts
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn do_once(&self, req: &mut Request, resp: &mut Response) -> crate::Result<()> {
        let permit = self
            .pool
            .acquire_permit(self.options.max_conn_wait_timeout)
            .await?;

        let (mut conn, created_at) = match self.pool.checkout() {
            Some(idle) => {
                trace!("reusing pooled connection to {}", self.host);
                (idle.conn, idle.created_at)
            }
            None => {
                let addr = self.dial_addr();
                trace!("dialing {}", addr);
                let conn = match self.options.dial_timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, self.dialer.dial(&addr)).await {
                            Ok(conn) => conn?,
                            Err(_elapsed) => return Err(crate::Error::new_timeout()),
                        }
                    }
                    None => self.dialer.dial(&addr).await?,
                };
                (conn, Instant::now())
            }
        };

        conn.set_read_timeout(self.options.read_timeout);
        conn.set_write_timeout(self.options.write_timeout);

        let result = h1::client::do_request(
            &mut conn,
            req,
            resp,
            self.options.disable_header_names_normalizing,
        )
        .await;

        match result {
            Ok(reusable) => {
                if reusable && self.options.keep_alive {
                    self.pool.checkin(conn, created_at);
                } else {
                    let _ = conn.shutdown().await;
                }
                drop(permit);
                Ok(())
            }
            Err(err) => {
                drop(conn);
                drop(permit);
                Err(err)
            }
        }
    }

    /// Whether the engine's cleaner may drop this host client: nothing
    /// pooled, nothing pending.
    pub(crate) fn should_remove(&self) -> bool {
        self.pool.is_unused()
    }

    /// Periodic sweep of expired idle connections.
    pub(crate) fn evict_expired(&self) {
        self.pool.evict_expired();
    }
}
