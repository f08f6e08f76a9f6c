//! Server-side surface: options and the accepting transport.

use std::time::Duration;

use ipnet::IpNet;

use crate::tracer;

pub(crate) mod transport;

pub use self::transport::{OnAccept, OnConnect, RawStream, Transport};

/// Which kind of listener the transport binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

/// Options consumed by the engine and the HTTP/1.1 server loop.
///
/// This is the plain parameter surface; builder DSLs live outside the core.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub network: Network,
    pub address: String,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// How long a kept-alive connection may sit idle between requests.
    /// `None` keeps the loop parked on the read timeout instead.
    pub idle_timeout: Option<Duration>,
    pub max_request_body_size: usize,
    /// Reject anything but GET; for hardened edge deployments.
    pub get_only: bool,
    pub disable_keepalive: bool,
    /// Leave request bodies on the connection until the handler pulls them.
    pub streaming: bool,
    pub redirect_trailing_slash: bool,
    pub redirect_fixed_path: bool,
    pub handle_method_not_allowed: bool,
    pub use_raw_path: bool,
    pub remove_extra_slash: bool,
    pub disable_header_names_normalizing: bool,
    /// After a hijack handler returns, keep the connection instead of
    /// closing it.
    pub keep_hijacked_conns: bool,
    pub trusted_proxies: Vec<IpNet>,
    /// Forwarded-address headers walked right to left during client-IP
    /// resolution.
    pub forwarded_headers: Vec<String>,
    pub enable_trace: bool,
    pub trace_level: tracer::Level,
    /// Advertise ALPN identifiers of every registered protocol server.
    pub alpn: bool,
    /// Sniff the cleartext HTTP/2 preface and dispatch to a registered "h2"
    /// server.
    pub h2c: bool,
    pub shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            network: Network::Tcp,
            address: "127.0.0.1:8888".to_owned(),
            read_timeout: Some(Duration::from_secs(60 * 3)),
            write_timeout: None,
            idle_timeout: Some(Duration::from_secs(60 * 3)),
            max_request_body_size: 4 * 1024 * 1024,
            get_only: false,
            disable_keepalive: false,
            streaming: false,
            redirect_trailing_slash: true,
            redirect_fixed_path: false,
            handle_method_not_allowed: false,
            use_raw_path: false,
            remove_extra_slash: false,
            disable_header_names_normalizing: false,
            keep_hijacked_conns: false,
            trusted_proxies: Vec::new(),
            forwarded_headers: vec!["X-Forwarded-For".to_owned(), "X-Real-IP".to_owned()],
            enable_trace: false,
            trace_level: tracer::Level::Base,
            alpn: false,
            h2c: false,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}
