//! Streaming body decoders.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::netio::Conn;

use super::parse::BodyLength;

/// Longest accepted chunk-size line, extensions included.
const MAX_CHUNK_SIZE_LINE: usize = 1024;
/// Cap on trailer section bytes after the last chunk.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// Decodes one message body off a connection.
///
/// `decode` returns successive chunks; an empty chunk means the body is
/// complete. The decoder does not enforce a size limit itself — callers sum
/// what they accept.
#[derive(Debug)]
pub(crate) enum Decoder {
    Length { remaining: u64 },
    Chunked { state: ChunkedState },
    CloseDelimited { done: bool },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkedState {
    Size,
    Data { remaining: u64 },
    DataDone,
    Trailer,
    Done,
}

impl Decoder {
    pub(crate) fn length(n: u64) -> Decoder {
        Decoder::Length { remaining: n }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder::Chunked {
            state: ChunkedState::Size,
        }
    }

    pub(crate) fn close_delimited() -> Decoder {
        Decoder::CloseDelimited { done: false }
    }

    /// A decoder for the framing the parser reported, `None` when the
    /// message has no body.
    pub(crate) fn for_body(body: BodyLength) -> Option<Decoder> {
        match body {
            BodyLength::Empty => None,
            BodyLength::Length(n) => Some(Decoder::length(n)),
            BodyLength::Chunked => Some(Decoder::chunked()),
            BodyLength::CloseDelimited => Some(Decoder::close_delimited()),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        match self {
            Decoder::Length { remaining } => *remaining == 0,
            Decoder::Chunked { state } => *state == ChunkedState::Done,
            Decoder::CloseDelimited { done } => *done,
        }
    }

    /// Reads the next chunk of the body. Empty means complete.
    pub(crate) async fn decode(&mut self, conn: &mut Conn) -> crate::Result<Bytes> {
        match self {
            Decoder::Length { remaining } => {
                if *remaining == 0 {
                    return Ok(Bytes::new());
                }
                let max = std::cmp::min(*remaining, usize::MAX as u64) as usize;
                let chunk = conn.read_some(max).await?;
                if chunk.is_empty() {
                    debug!("connection closed with {} body bytes pending", remaining);
                    return Err(crate::Error::new_incomplete());
                }
                *remaining -= chunk.len() as u64;
                trace!("read {} body bytes, {} remaining", chunk.len(), remaining);
                Ok(chunk)
            }
            Decoder::Chunked { state } => loop {
                match state {
                    ChunkedState::Size => {
                        let line = conn.read_line(MAX_CHUNK_SIZE_LINE).await?;
                        let size = parse_chunk_size(&line)?;
                        trace!("chunk size: {}", size);
                        if size == 0 {
                            *state = ChunkedState::Trailer;
                        } else {
                            *state = ChunkedState::Data { remaining: size };
                        }
                    }
                    ChunkedState::Data { remaining } => {
                        let max = std::cmp::min(*remaining, usize::MAX as u64) as usize;
                        let chunk = conn.read_some(max).await?;
                        if chunk.is_empty() {
                            return Err(crate::Error::new_incomplete());
                        }
                        *remaining -= chunk.len() as u64;
                        if *remaining == 0 {
                            *state = ChunkedState::DataDone;
                        }
                        return Ok(chunk);
                    }
                    ChunkedState::DataDone => {
                        // CRLF closing the chunk-data.
                        let crlf = conn.read_binary(2).await?;
                        if &crlf[..] != b"\r\n" {
                            debug!("chunk data not terminated by CRLF");
                            return Err(crate::Error::new_parse(crate::error::Parse::Header));
                        }
                        *state = ChunkedState::Size;
                    }
                    ChunkedState::Trailer => {
                        let mut limit = MAX_TRAILER_BYTES;
                        loop {
                            let line = conn.read_line(limit).await?;
                            if line.is_empty() {
                                break;
                            }
                            limit = limit.saturating_sub(line.len());
                            if limit == 0 {
                                return Err(crate::Error::new_too_large());
                            }
                        }
                        *state = ChunkedState::Done;
                        return Ok(Bytes::new());
                    }
                    ChunkedState::Done => return Ok(Bytes::new()),
                }
            },
            Decoder::CloseDelimited { done } => {
                if *done {
                    return Ok(Bytes::new());
                }
                let chunk = conn.read_some(8 * 1024).await?;
                if chunk.is_empty() {
                    *done = true;
                }
                Ok(chunk)
            }
        }
    }

    /// Reads and discards whatever is left of the body.
    pub(crate) async fn drain(&mut self, conn: &mut Conn) -> crate::Result<()> {
        while !self.is_done() {
            if self.decode(conn).await?.is_empty() && !self.is_done() {
                return Err(crate::Error::new_incomplete());
            }
        }
        Ok(())
    }
}

fn parse_chunk_size(line: &[u8]) -> crate::Result<u64> {
    // Chunk extensions after ';' are tolerated and ignored.
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = std::str::from_utf8(digits)
        .map_err(|_| crate::Error::new_parse(crate::error::Parse::Header))?
        .trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| crate::Error::new_parse(crate::error::Parse::Header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn conn_with(data: &[u8]) -> Conn {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        b.write_all(data).await.unwrap();
        drop(b);
        Conn::new(a)
    }

    async fn collect(dec: &mut Decoder, conn: &mut Conn) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = dec.decode(conn).await?;
            if chunk.is_empty() {
                if dec.is_done() {
                    return Ok(out);
                }
                continue;
            }
            out.extend_from_slice(&chunk);
        }
    }

    #[tokio::test]
    async fn length_decoder_exact() {
        let mut conn = conn_with(b"12345extra").await;
        let mut dec = Decoder::length(5);
        let body = collect(&mut dec, &mut conn).await.unwrap();
        assert_eq!(body, b"12345");
        assert_eq!(conn.read_binary(5).await.unwrap().as_ref(), b"extra");
    }

    #[tokio::test]
    async fn length_decoder_short_stream_is_incomplete() {
        let mut conn = conn_with(b"123").await;
        let mut dec = Decoder::length(5);
        let err = collect(&mut dec, &mut conn).await.unwrap_err();
        assert!(err.is_incomplete_message());
    }

    #[tokio::test]
    async fn chunked_decoder_round() {
        let mut conn = conn_with(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nnext").await;
        let mut dec = Decoder::chunked();
        let body = collect(&mut dec, &mut conn).await.unwrap();
        assert_eq!(body, b"Wikipedia");
        assert_eq!(conn.read_binary(4).await.unwrap().as_ref(), b"next");
    }

    #[tokio::test]
    async fn chunked_decoder_ignores_extensions_and_trailers() {
        let mut conn =
            conn_with(b"3;name=val\r\nabc\r\n0\r\nTrailer-One: x\r\n\r\n").await;
        let mut dec = Decoder::chunked();
        let body = collect(&mut dec, &mut conn).await.unwrap();
        assert_eq!(body, b"abc");
    }

    #[tokio::test]
    async fn chunked_bad_size_line() {
        let mut conn = conn_with(b"zz\r\nabc\r\n").await;
        let mut dec = Decoder::chunked();
        assert!(collect(&mut dec, &mut conn).await.unwrap_err().is_parse());
    }

    #[tokio::test]
    async fn close_delimited_reads_to_eof() {
        let mut conn = conn_with(b"all of it").await;
        let mut dec = Decoder::close_delimited();
        let body = collect(&mut dec, &mut conn).await.unwrap();
        assert_eq!(body, b"all of it");
    }

    #[tokio::test]
    async fn drain_discards_remainder() {
        let mut conn = conn_with(b"4\r\nWiki\r\n0\r\n\r\nrest").await;
        let mut dec = Decoder::chunked();
        dec.drain(&mut conn).await.unwrap();
        assert_eq!(conn.read_binary(4).await.unwrap().as_ref(), b"rest");
    }
}
