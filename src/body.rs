//! Request and response bodies.

use std::fmt;

use bytes::Bytes;
use tokio::io::AsyncRead;

/// A message body: a byte buffer, an opaque readable stream with a known or
/// unknown length, or — for requests in streaming mode — bytes still sitting
/// on the connection, pulled through the request context on demand.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Reader {
        reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
        len: Option<u64>,
    },
    /// The body has not been read off the connection yet; only meaningful on
    /// a server request while its context still owns the connection.
    Streamed,
}

impl Body {
    pub fn empty() -> Body {
        Body::Empty
    }

    pub fn bytes(data: impl Into<Bytes>) -> Body {
        Body::Bytes(data.into())
    }

    /// A streaming body with a known length, written with `Content-Length`.
    pub fn sized_reader(reader: impl AsyncRead + Send + Sync + Unpin + 'static, len: u64) -> Body {
        Body::Reader {
            reader: Box::new(reader),
            len: Some(len),
        }
    }

    /// A streaming body of unknown length, written with chunked encoding.
    pub fn chunked_reader(reader: impl AsyncRead + Send + Sync + Unpin + 'static) -> Body {
        Body::Reader {
            reader: Box::new(reader),
            len: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }

    /// The body length when it is knowable without reading.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Reader { len, .. } => *len,
            Body::Streamed => None,
        }
    }

    /// Takes the buffered bytes out, leaving the body empty.
    ///
    /// Returns `None` for reader and streamed bodies.
    pub fn take_bytes(&mut self) -> Option<Bytes> {
        match std::mem::replace(self, Body::Empty) {
            Body::Empty => Some(Bytes::new()),
            Body::Bytes(b) => Some(b),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Body {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Body {
        Body::Bytes(b.into())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(b: &'static [u8]) -> Body {
        Body::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::Bytes(s.into())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Reader { len, .. } => write!(f, "Body::Reader(len={:?})", len),
            Body::Streamed => f.write_str("Body::Streamed"),
        }
    }
}
