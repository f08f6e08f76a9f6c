//! Protocol-server registry hooks.
//!
//! The engine speaks HTTP/1.1 natively; anything else — HTTP/2 over TLS via
//! ALPN, H2C via its cleartext preface — plugs in through this trait and is
//! dispatched per connection after the accept.

use crate::common::BoxFuture;
use crate::engine::Engine;
use crate::netio::Conn;

/// The cleartext HTTP/2 connection preface.
pub const H2C_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Identifier of the built-in HTTP/1.1 server.
pub const PROTOCOL_HTTP1: &str = "http/1.1";

/// A per-protocol connection server.
///
/// Implementations own the connection for its whole lifetime and return when
/// it is done; the engine is passed back in so servers stay cheap to
/// construct and free of reference cycles.
pub trait ProtocolServer: Send + Sync + 'static {
    /// The ALPN identifier this server answers to.
    fn protocol(&self) -> &'static str;

    fn serve<'a>(&'a self, engine: &'a Engine, conn: Conn) -> BoxFuture<'a, crate::Result<()>>;
}
