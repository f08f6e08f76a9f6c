//! The layered network transport abstraction.
//!
//! A [`Conn`] wraps any duplex byte stream behind one buffered, peek-able
//! interface. Reads never hand out partial results: `peek(n)` yields exactly
//! `n` bytes or fails. Writes stage into a segment queue; slices of 4 KiB and
//! up are retained by reference and flushed with a vectored write instead of
//! being copied.
//!
//! The backend is anything implementing [`Io`] — a tokio TCP or Unix socket,
//! a TLS wrapper, or an in-memory duplex pipe in tests. Deadlines are applied
//! per operation and backend errors are normalized into the two canonical
//! kinds, connection-closed and timeout, before they reach protocol code.

use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) mod buffered;

use self::buffered::{ReadBuffer, WriteBuffer};

/// A pluggable connection backend.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

/// A buffered, peek-able duplex connection.
pub struct Conn {
    io: Box<dyn Io>,
    rb: ReadBuffer,
    wb: WriteBuffer,
    eof: bool,
    latched: Option<io::Error>,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    negotiated_protocol: Option<String>,
}

async fn deadline<T, F>(limit: Option<Duration>, fut: F) -> crate::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(crate::Error::new_io(e)),
            Err(_elapsed) => Err(crate::Error::new_timeout()),
        },
        None => fut.await.map_err(crate::Error::new_io),
    }
}

impl Conn {
    pub fn new(io: impl Io) -> Conn {
        Conn::from_boxed(Box::new(io))
    }

    pub fn from_boxed(io: Box<dyn Io>) -> Conn {
        Conn {
            io,
            rb: ReadBuffer::new(),
            wb: WriteBuffer::new(),
            eof: false,
            latched: None,
            remote: None,
            local: None,
            read_timeout: None,
            write_timeout: None,
            negotiated_protocol: None,
        }
    }

    pub fn with_addrs(mut self, remote: Option<SocketAddr>, local: Option<SocketAddr>) -> Conn {
        self.remote = remote;
        self.local = local;
        self
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// The ALPN protocol selected during the handshake, when there was one.
    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.negotiated_protocol.as_deref()
    }

    pub fn set_negotiated_protocol(&mut self, proto: impl Into<String>) {
        self.negotiated_protocol = Some(proto.into());
    }

    // ===== read side =====

    /// Number of unread bytes currently buffered.
    #[inline]
    pub fn len(&self) -> usize {
        self.rb.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rb.len() == 0
    }

    /// All currently buffered unread bytes, without advancing.
    pub(crate) fn buffered(&self) -> &[u8] {
        self.rb.bytes()
    }

    /// Reads `n` bytes without advancing the cursor.
    ///
    /// The returned slice is valid until the next `release`. Fails with the
    /// connection-closed kind if the stream ends first.
    pub async fn peek(&mut self, n: usize) -> crate::Result<&[u8]> {
        self.fill_to(n).await?;
        Ok(&self.rb.bytes()[..n])
    }

    /// Advances the read cursor by `n` already-buffered bytes.
    pub fn skip(&mut self, n: usize) {
        self.rb.skip(n);
    }

    pub async fn read_byte(&mut self) -> crate::Result<u8> {
        self.fill_to(1).await?;
        let b = self.rb.bytes()[0];
        self.rb.skip(1);
        Ok(b)
    }

    /// Takes the next `n` bytes out of the buffer, advancing past them.
    pub async fn read_binary(&mut self, n: usize) -> crate::Result<Bytes> {
        self.fill_to(n).await?;
        Ok(self.rb.split_to(n))
    }

    /// Reclaims all fully-read buffer memory.
    ///
    /// Slices returned by earlier `peek` calls must not be used afterwards;
    /// the borrow checker enforces exactly that.
    pub fn release(&mut self) {
        self.rb.release();
    }

    /// Takes up to `max` bytes, filling once if the buffer is empty.
    ///
    /// Returns an empty `Bytes` on a clean EOF.
    pub(crate) async fn read_some(&mut self, max: usize) -> crate::Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        if self.rb.len() == 0 && self.fill_more().await? == 0 {
            return Ok(Bytes::new());
        }
        let n = std::cmp::min(self.rb.len(), max);
        Ok(self.rb.split_to(n))
    }

    /// Reads through the next LF, returning the line without its line ending.
    pub(crate) async fn read_line(&mut self, max: usize) -> crate::Result<Bytes> {
        let mut scanned = 0;
        loop {
            let buf = self.rb.bytes();
            if let Some(pos) = buf[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + pos;
                let mut line = self.rb.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(line);
            }
            scanned = buf.len();
            if scanned > max {
                return Err(crate::Error::new_too_large());
            }
            if self.fill_more().await? == 0 {
                return Err(crate::Error::new_incomplete());
            }
        }
    }

    /// Performs one read from the backend, growing the buffer.
    ///
    /// Returns the number of new bytes, with zero meaning a clean EOF.
    pub(crate) async fn fill_more(&mut self) -> crate::Result<usize> {
        self.fill_step(1).await
    }

    /// Ensures at least `n` unread bytes are buffered.
    async fn fill_to(&mut self, n: usize) -> crate::Result<()> {
        while self.rb.len() < n {
            let need = n - self.rb.len();
            if self.fill_step(need).await? == 0 {
                return Err(crate::Error::new_closed());
            }
        }
        Ok(())
    }

    /// One backend read. Hard errors are latched so later operations fail
    /// the same way after the already-buffered bytes are drained, without
    /// touching the dead backend again.
    async fn fill_step(&mut self, need: usize) -> crate::Result<usize> {
        if let Some(err) = self.latched.take() {
            return Err(crate::Error::new_io(err));
        }
        if self.eof {
            return Ok(0);
        }
        match self.read_raw(need).await {
            Ok(0) => {
                trace!("read eof");
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                trace!("read {} bytes", n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                // Deadline expiry is retryable; keep-alive idling depends on
                // the connection staying usable afterwards.
                Err(crate::Error::new_timeout())
            }
            Err(e) => {
                self.latched = Some(io::Error::from(e.kind()));
                Err(crate::Error::new_io(e))
            }
        }
    }

    async fn read_raw(&mut self, need: usize) -> io::Result<usize> {
        let buf = self.rb.prepare(need);
        match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.io.read_buf(buf)).await {
                Ok(res) => res,
                Err(_elapsed) => Err(io::ErrorKind::TimedOut.into()),
            },
            None => self.io.read_buf(buf).await,
        }
    }

    // ===== write side =====

    /// Reserves `n` writable bytes, returned as a mutable slice view.
    pub fn malloc(&mut self, n: usize) -> &mut [u8] {
        self.wb.malloc(n)
    }

    /// Appends `buf` to the pending write queue.
    ///
    /// Buffers of 4 KiB and up are retained by reference until `flush`;
    /// passing ownership of the `Bytes` is what makes that sound.
    pub fn write_binary(&mut self, buf: Bytes) {
        self.wb.write(buf);
    }

    /// Copies a small slice into the staging buffer.
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.wb.extend(slice);
    }

    pub(crate) fn can_buffer(&self) -> bool {
        self.wb.can_buffer()
    }

    /// Drains every pending write to the wire.
    pub async fn flush(&mut self) -> crate::Result<()> {
        while !self.wb.is_empty() {
            let mut slices: Vec<IoSlice<'_>> = Vec::new();
            self.wb.chunks_vectored(&mut slices);
            let io = &mut self.io;
            let n = deadline(self.write_timeout, io.write_vectored(&slices)).await?;
            trace!("flushed {} bytes", n);
            if n == 0 {
                return Err(crate::Error::new_io(io::ErrorKind::WriteZero.into()));
            }
            drop(slices);
            self.wb.advance(n);
        }
        self.wb.release();
        deadline(self.write_timeout, self.io.flush()).await
    }

    /// Shuts down the write side of the backend.
    pub async fn shutdown(&mut self) -> crate::Result<()> {
        deadline(self.write_timeout, self.io.shutdown()).await
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("buffered", &self.rb.len())
            .field("pending_write", &self.wb.remaining())
            .field("remote", &self.remote)
            .finish()
    }
}
