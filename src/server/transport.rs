//! Listener transport: binds, accepts, and drives one task per connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace};

use crate::engine::Engine;
use crate::netio::Conn;

use super::{Network, ServerOptions};

/// The raw accepted socket, before any buffering, for allow-list style
/// filtering.
pub enum RawStream<'a> {
    Tcp(&'a TcpStream),
    #[cfg(unix)]
    Unix(&'a UnixStream),
}

/// Inspects a raw accepted socket; returning `false` drops it.
pub type OnAccept = Arc<dyn for<'a> Fn(&RawStream<'a>) -> bool + Send + Sync>;

/// Inspects the wrapped connection right before serving; returning `false`
/// drops it.
pub type OnConnect = Arc<dyn Fn(&mut Conn) -> bool + Send + Sync>;

/// Accepts connections and runs each one on its own task until the
/// shutdown signal flips.
pub struct Transport {
    options: Arc<ServerOptions>,
    on_accept: Option<OnAccept>,
    on_connect: Option<OnConnect>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Transport {
    pub fn new(options: Arc<ServerOptions>) -> Transport {
        Transport {
            options,
            on_accept: None,
            on_connect: None,
        }
    }

    pub fn set_on_accept(&mut self, hook: OnAccept) {
        self.on_accept = Some(hook);
    }

    pub fn set_on_connect(&mut self, hook: OnConnect) {
        self.on_connect = Some(hook);
    }

    async fn bind(&self) -> crate::Result<Listener> {
        match self.options.network {
            Network::Tcp => {
                let listener = TcpListener::bind(&self.options.address)
                    .await
                    .map_err(crate::Error::new_listen)?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Network::Unix => {
                let _ = std::fs::remove_file(&self.options.address);
                let listener =
                    UnixListener::bind(&self.options.address).map_err(crate::Error::new_listen)?;
                Ok(Listener::Unix(listener))
            }
            #[cfg(not(unix))]
            Network::Unix => Err(crate::Error::new_listen(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))),
        }
    }

    /// Accepts until the shutdown signal flips, then waits out every
    /// spawned connection task.
    pub async fn listen_and_serve(
        self,
        engine: Arc<Engine>,
        mut shutdown: watch::Receiver<bool>,
    ) -> crate::Result<()> {
        let listener = self.bind().await?;
        if let Listener::Tcp(l) = &listener {
            if let Ok(addr) = l.local_addr() {
                engine.set_local_addr(addr);
            }
        }

        // Every connection task holds a clone of `guard`; the drain below
        // completes when the last clone drops.
        let (guard, mut drained) = mpsc::channel::<()>(1);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        trace!("transport stopping accept loop");
                        break;
                    }
                }
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((stream, remote, local)) => {
                            if let Some(hook) = &self.on_accept {
                                let keep = match &stream {
                                    Accepted::Tcp(s) => hook(&RawStream::Tcp(s)),
                                    #[cfg(unix)]
                                    Accepted::Unix(s) => hook(&RawStream::Unix(s)),
                                };
                                if !keep {
                                    trace!("on_accept rejected {:?}", remote);
                                    continue;
                                }
                            }
                            let mut conn = stream.into_conn().with_addrs(remote, local);
                            if let Some(hook) = &self.on_connect {
                                if !hook(&mut conn) {
                                    trace!("on_connect rejected {:?}", remote);
                                    continue;
                                }
                            }
                            let engine = engine.clone();
                            let guard = guard.clone();
                            tokio::spawn(async move {
                                if let Err(err) = engine.serve_connection(conn).await {
                                    debug!("connection ended with error: {}", err);
                                }
                                drop(guard);
                            });
                        }
                        Err(e) => {
                            if is_connection_error(&e) {
                                debug!("transient accept error: {}", e);
                                continue;
                            }
                            error!("accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        drop(guard);
        let _ = drained.recv().await;
        Ok(())
    }
}

enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Accepted {
    fn into_conn(self) -> Conn {
        match self {
            Accepted::Tcp(s) => {
                let _ = s.set_nodelay(true);
                Conn::new(s)
            }
            #[cfg(unix)]
            Accepted::Unix(s) => Conn::new(s),
        }
    }
}

async fn accept(
    listener: &Listener,
) -> io::Result<(Accepted, Option<SocketAddr>, Option<SocketAddr>)> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, remote) = l.accept().await?;
            let local = stream.local_addr().ok();
            Ok((Accepted::Tcp(stream), Some(remote), local))
        }
        #[cfg(unix)]
        Listener::Unix(l) => {
            let (stream, _) = l.accept().await?;
            Ok((Accepted::Unix(stream), None, None))
        }
    }
}

/// Errors the accept loop treats as per-connection noise rather than a
/// listener failure.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
