//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have gale `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// The peer closed the connection, or the local side shut it down.
    ConnectionClosed,
    /// A read, write, or idle deadline elapsed.
    Timeout,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// An `io::Error` while reading or writing a network stream that maps
    /// to neither closure nor timeout.
    Io,
    /// Error creating a listener.
    Listen,
    /// Error occurred while dialing a remote host.
    Connect,
    /// The server loop relinquished the connection to a hijack handler.
    ///
    /// Not a failure; signals the caller must not reuse the connection.
    Hijacked,
    /// The server decided not to keep the connection alive.
    ///
    /// Internal sentinel returned from the request loop.
    ShortConnection,
    /// Waited longer than `max_conn_wait_timeout` for a pooled connection.
    NoFreeConns,
    /// Error while writing a body to the connection.
    BodyWrite,
    /// Service discovery produced no usable instance.
    NoInstance,
    /// Errors caused by user action.
    User(User),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    TooLarge,
    Status,
    Internal,
}

#[derive(Debug)]
pub(crate) enum User {
    /// The request is missing a Host header and has no absolute URI.
    MissingHost,
    /// The request URI carries a scheme no host-client supports.
    UnsupportedScheme,
    /// The hijack writer or handler failed.
    Hijack,
    /// Error returned from a user's service-discovery resolver.
    Resolve,
}

// Sentinel cause marking errors produced by an elapsed deadline.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this parse error was caused by a message exceeding
    /// the configured maximum size.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if the connection was closed by either side.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// Returns true if a read, write, or idle deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was about a request that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the connection closed before a message could
    /// complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this is the sentinel signaling a hijacked
    /// connection.
    pub fn is_hijacked(&self) -> bool {
        matches!(self.inner.kind, Kind::Hijacked)
    }

    pub(crate) fn is_short_connection(&self) -> bool {
        matches!(self.inner.kind, Kind::ShortConnection)
    }

    /// Returns true if no pooled connection became free in time.
    pub fn is_no_free_conns(&self) -> bool {
        matches!(self.inner.kind, Kind::NoFreeConns)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout).with(TimedOut)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    /// Normalizes an `io::Error` into the canonical closed/timeout kinds.
    ///
    /// Anything that is neither closure nor deadline propagates as `Io`
    /// with the original error attached.
    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        use std::io::ErrorKind;
        match cause.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected => Error::new(Kind::ConnectionClosed).with(cause),
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Error::new(Kind::Timeout).with(cause)
            }
            _ => Error::new(Kind::Io).with(cause),
        }
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_hijacked() -> Error {
        Error::new(Kind::Hijacked)
    }

    pub(crate) fn new_short_connection() -> Error {
        Error::new(Kind::ShortConnection)
    }

    pub(crate) fn new_no_free_conns() -> Error {
        Error::new(Kind::NoFreeConns)
    }

    pub(crate) fn new_body_write<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_no_instance() -> Error {
        Error::new(Kind::NoInstance)
    }

    pub(crate) fn new_user_missing_host() -> Error {
        Error::new(Kind::User(User::MissingHost))
    }

    pub(crate) fn new_user_unsupported_scheme() -> Error {
        Error::new(Kind::User(User::UnsupportedScheme))
    }

    pub(crate) fn new_user_hijack<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Hijack)).with(cause)
    }

    pub(crate) fn new_user_resolve<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Resolve)).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head or body is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Internal) => "internal error inside gale",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::ConnectionClosed => "connection closed",
            Kind::Timeout => "operation timed out",
            Kind::Canceled => "operation was canceled",
            Kind::Io => "connection error",
            Kind::Listen => "error creating listener",
            Kind::Connect => "error trying to connect",
            Kind::Hijacked => "connection was hijacked",
            Kind::ShortConnection => "connection is not kept alive",
            Kind::NoFreeConns => "no free connections available to host",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::NoInstance => "instance not found",
            Kind::User(User::MissingHost) => "request has no Host header or absolute URI",
            Kind::User(User::UnsupportedScheme) => "request URI scheme is not supported",
            Kind::User(User::Hijack) => "hijack handler failed",
            Kind::User(User::Resolve) => "service resolver failed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("gale::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline has elapsed")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>(),
            "Error size of pointer"
        );
    }

    #[test]
    fn io_closed_kinds_normalize() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
        ] {
            let err = Error::new_io(io::Error::new(kind, "nope"));
            assert!(err.is_closed(), "{:?} should normalize to closed", kind);
        }
    }

    #[test]
    fn io_timeout_normalizes() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_timeout());
        assert!(!err.is_closed());
    }

    #[test]
    fn other_io_errors_propagate_verbatim() {
        let err = Error::new_io(io::Error::new(io::ErrorKind::Other, "weird"));
        assert!(!err.is_closed());
        assert!(!err.is_timeout());
        assert!(err.into_cause().is_some());
    }

    #[test]
    fn timeout_carries_sentinel_cause() {
        let err = Error::new_timeout();
        assert!(err.is_timeout());
        let cause = err.into_cause().expect("sentinel cause");
        assert!(cause.downcast_ref::<TimedOut>().is_some());
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::new_user_unsupported_scheme().with("no TLS dialer installed");
        let text = err.to_string();
        assert!(text.contains("scheme"), "{}", text);
        assert!(text.contains("no TLS dialer installed"), "{}", text);
    }
}
