//! Read and write buffer internals for [`Conn`](super::Conn).

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes, BytesMut};

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// Write buffers retained across requests larger than this are replaced by a
/// fresh allocation on release.
pub(crate) const MAX_IDLE_BUFFER_SIZE: usize = 512 * 1024;

/// Slices at least this large are queued by reference instead of copied into
/// the staging buffer.
pub(crate) const ZERO_COPY_MIN_SIZE: usize = 4096;

/// The maximum number of queued segments before a flush is forced.
pub(crate) const MAX_WRITE_SEGMENTS: usize = 16;

/// Buffered unread bytes with an explicit consume cursor.
///
/// `pos` tracks how far the caller has consumed; the bytes before it are
/// reclaimed by [`release`](ReadBuffer::release), which invalidates every
/// slice previously handed out.
pub(crate) struct ReadBuffer {
    buf: BytesMut,
    pos: usize,
    /// Largest fill ever requested, used to size fresh allocations.
    high_water: usize,
}

impl ReadBuffer {
    pub(crate) fn new() -> ReadBuffer {
        ReadBuffer {
            buf: BytesMut::new(),
            pos: 0,
            high_water: INIT_BUFFER_SIZE,
        }
    }

    /// Unconsumed bytes currently buffered.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    #[inline]
    pub(crate) fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.pos += n;
    }

    /// Splits off the next `n` unconsumed bytes without copying.
    pub(crate) fn split_to(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len());
        self.buf.advance(self.pos);
        self.pos = 0;
        self.buf.split_to(n).freeze()
    }

    /// Reclaims all consumed memory. Oversized spare capacity is dropped so
    /// one huge message does not pin its allocation for the connection's
    /// lifetime.
    pub(crate) fn release(&mut self) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
        if self.buf.is_empty() && self.buf.capacity() > MAX_IDLE_BUFFER_SIZE {
            self.buf = BytesMut::new();
        }
    }

    /// Prepares spare capacity for a fill that wants `need` more bytes
    /// buffered, and returns the target buffer.
    pub(crate) fn prepare(&mut self, need: usize) -> &mut BytesMut {
        let want = std::cmp::max(need, self.high_water);
        if need > self.high_water {
            self.high_water = need;
        }
        if self.buf.capacity() - self.buf.len() < want {
            self.buf.reserve(want);
        }
        &mut self.buf
    }
}

/// Staged outgoing bytes: an ordered run of frozen segments plus a mutable
/// tail the small writes append to.
pub(crate) struct WriteBuffer {
    segments: VecDeque<Bytes>,
    tail: BytesMut,
}

impl WriteBuffer {
    pub(crate) fn new() -> WriteBuffer {
        WriteBuffer {
            segments: VecDeque::new(),
            tail: BytesMut::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum::<usize>() + self.tail.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.tail.is_empty()
    }

    pub(crate) fn can_buffer(&self) -> bool {
        self.segments.len() < MAX_WRITE_SEGMENTS
    }

    /// Reserves `n` writable bytes and returns them as a mutable view. The
    /// bytes count as written once the view is filled.
    pub(crate) fn malloc(&mut self, n: usize) -> &mut [u8] {
        let start = self.tail.len();
        self.tail.resize(start + n, 0);
        &mut self.tail[start..]
    }

    /// Appends `buf`. Large buffers are queued by reference; ownership of the
    /// `Bytes` stands in for the "do not mutate until flushed" contract.
    pub(crate) fn write(&mut self, buf: Bytes) {
        if buf.is_empty() {
            return;
        }
        if buf.len() >= ZERO_COPY_MIN_SIZE {
            if !self.tail.is_empty() {
                let staged = self.tail.split().freeze();
                self.segments.push_back(staged);
            }
            self.segments.push_back(buf);
        } else {
            self.tail.extend_from_slice(&buf);
        }
    }

    pub(crate) fn extend(&mut self, slice: &[u8]) {
        self.tail.extend_from_slice(slice);
    }

    /// Collects IoSlices over every pending segment for a vectored write.
    pub(crate) fn chunks_vectored<'a>(&'a self, dst: &mut Vec<IoSlice<'a>>) {
        for seg in &self.segments {
            if !seg.is_empty() {
                dst.push(IoSlice::new(seg));
            }
        }
        if !self.tail.is_empty() {
            dst.push(IoSlice::new(&self.tail));
        }
    }

    /// Drops `n` bytes off the front after a (possibly partial) write.
    pub(crate) fn advance(&mut self, mut n: usize) {
        while n > 0 {
            match self.segments.front_mut() {
                Some(front) => {
                    let rem = front.len();
                    if rem > n {
                        front.advance(n);
                        return;
                    }
                    n -= rem;
                    self.segments.pop_front();
                }
                None => {
                    debug_assert!(n <= self.tail.len());
                    self.tail.advance(n);
                    return;
                }
            }
        }
    }

    /// Reclaims the staging buffer after a full flush.
    pub(crate) fn release(&mut self) {
        debug_assert!(self.is_empty());
        self.segments.clear();
        if self.tail.capacity() > MAX_IDLE_BUFFER_SIZE {
            self.tail = BytesMut::with_capacity(INIT_BUFFER_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_buffer_skip_then_release() {
        let mut rb = ReadBuffer::new();
        rb.prepare(16).extend_from_slice(b"hello world");
        assert_eq!(rb.len(), 11);
        rb.skip(6);
        assert_eq!(rb.bytes(), b"world");
        rb.release();
        assert_eq!(rb.bytes(), b"world");
        assert_eq!(rb.len(), 5);
    }

    #[test]
    fn read_buffer_split_is_zero_copy() {
        let mut rb = ReadBuffer::new();
        rb.prepare(8).extend_from_slice(b"abcdef");
        let chunk = rb.split_to(4);
        assert_eq!(&chunk[..], b"abcd");
        assert_eq!(rb.bytes(), b"ef");
    }

    #[test]
    fn write_buffer_small_writes_coalesce() {
        let mut wb = WriteBuffer::new();
        wb.write(Bytes::from_static(b"hello "));
        wb.write(Bytes::from_static(b"world"));
        assert_eq!(wb.remaining(), 11);
        let mut slices = Vec::new();
        wb.chunks_vectored(&mut slices);
        assert_eq!(slices.len(), 1, "small writes share the staging buffer");
    }

    #[test]
    fn write_buffer_large_write_queued_by_reference() {
        let big = Bytes::from(vec![b'x'; ZERO_COPY_MIN_SIZE]);
        let ptr = big.as_ptr();
        let mut wb = WriteBuffer::new();
        wb.write(Bytes::from_static(b"head"));
        wb.write(big);
        let mut slices = Vec::new();
        wb.chunks_vectored(&mut slices);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[1].as_ptr(), ptr, "large slice must not be copied");
    }

    #[test]
    fn write_buffer_partial_advance() {
        let mut wb = WriteBuffer::new();
        wb.write(Bytes::from(vec![b'a'; ZERO_COPY_MIN_SIZE]));
        wb.write(Bytes::from_static(b"tail"));
        wb.advance(ZERO_COPY_MIN_SIZE + 2);
        assert_eq!(wb.remaining(), 2);
        wb.advance(2);
        assert!(wb.is_empty());
    }

    #[test]
    fn malloc_returns_view_of_requested_len() {
        let mut wb = WriteBuffer::new();
        let view = wb.malloc(4);
        assert_eq!(view.len(), 4);
        view.copy_from_slice(b"abcd");
        assert_eq!(wb.remaining(), 4);
    }
}
