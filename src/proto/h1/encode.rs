//! Serialization of message heads and bodies onto a connection.

use bytes::Bytes;
use http::Version;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::body::Body;
use crate::headers::{self, HeaderMap};
use crate::netio::Conn;
use crate::request::Request;
use crate::response::Response;

use super::date;

const STREAM_CHUNK_SIZE: usize = 8 * 1024;

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn extend_headers(dst: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name);
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value);
        dst.extend_from_slice(b"\r\n");
    }
}

/// Fixes up framing headers to match the body the message actually carries.
fn set_body_framing(headers: &mut HeaderMap, hint: Option<u64>, skip_body: bool) {
    match hint {
        Some(n) => {
            if skip_body && headers.contains(headers::CONTENT_LENGTH) {
                // HEAD responses keep whatever length the handler declared.
                return;
            }
            if n > 0 || !skip_body {
                let mut buf = itoa::Buffer::new();
                headers.set(headers::CONTENT_LENGTH, buf.format(n).as_bytes().to_vec());
            }
        }
        None => {
            headers.del(headers::CONTENT_LENGTH);
            headers.set(headers::TRANSFER_ENCODING, "chunked");
        }
    }
}

/// Writes a response head and body.
///
/// `head_only` suppresses the body while preserving its framing headers, the
/// HEAD-request contract. Streaming bodies flush as they go; the final flush
/// belongs to the caller.
pub(crate) async fn write_response(
    conn: &mut Conn,
    resp: &mut Response,
    head_only: bool,
) -> crate::Result<()> {
    let skip_body = head_only || resp.must_skip_body();
    if resp.must_skip_body() {
        // 204/304 and 1xx never frame a body.
        resp.headers_mut().del(headers::CONTENT_LENGTH);
        resp.headers_mut().del(headers::TRANSFER_ENCODING);
    } else {
        let hint = resp.body().len_hint();
        set_body_framing(resp.headers_mut(), hint, head_only);
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(version_str(resp.version()).as_bytes());
    head.push(b' ');
    let mut buf = itoa::Buffer::new();
    head.extend_from_slice(buf.format(resp.status().as_u16()).as_bytes());
    head.push(b' ');
    head.extend_from_slice(
        resp.status()
            .canonical_reason()
            .unwrap_or("Unknown")
            .as_bytes(),
    );
    head.extend_from_slice(b"\r\n");
    if !resp.headers().contains(headers::DATE) {
        head.extend_from_slice(b"Date: ");
        date::extend(&mut head);
        head.extend_from_slice(b"\r\n");
    }
    extend_headers(&mut head, resp.headers());
    head.extend_from_slice(b"\r\n");
    trace!("writing response head, {} bytes", head.len());
    conn.write_slice(&head);

    if skip_body {
        return Ok(());
    }
    write_body(conn, resp.body_mut()).await
}

/// Writes a client request head and body.
pub(crate) async fn write_request(conn: &mut Conn, req: &mut Request) -> crate::Result<()> {
    if !req.headers().contains(headers::HOST) {
        if let Some(authority) = req.uri().authority() {
            let host = authority.as_str().to_owned();
            req.headers_mut().set(headers::HOST, host);
        }
    }
    let hint = req.body().len_hint();
    let empty = req.body().is_empty();
    set_body_framing(req.headers_mut(), hint, empty);

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(req.path().as_bytes());
    if !req.query().is_empty() {
        head.push(b'?');
        head.extend_from_slice(req.query().as_bytes());
    }
    head.push(b' ');
    head.extend_from_slice(version_str(req.version()).as_bytes());
    head.extend_from_slice(b"\r\n");
    extend_headers(&mut head, req.headers());
    head.extend_from_slice(b"\r\n");
    conn.write_slice(&head);

    write_body(conn, req.body_mut()).await
}

async fn write_body(conn: &mut Conn, body: &mut Body) -> crate::Result<()> {
    match std::mem::take(body) {
        Body::Empty | Body::Streamed => Ok(()),
        Body::Bytes(data) => {
            conn.write_binary(data);
            Ok(())
        }
        Body::Reader {
            mut reader,
            len: Some(mut remaining),
        } => {
            let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
            while remaining > 0 {
                let want = std::cmp::min(remaining, STREAM_CHUNK_SIZE as u64) as usize;
                let n = reader
                    .read(&mut chunk[..want])
                    .await
                    .map_err(crate::Error::new_body_write)?;
                if n == 0 {
                    return Err(crate::Error::new_body_write(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )));
                }
                remaining -= n as u64;
                conn.write_binary(Bytes::copy_from_slice(&chunk[..n]));
                if !conn.can_buffer() {
                    conn.flush().await?;
                }
            }
            Ok(())
        }
        Body::Reader { mut reader, len: None } => {
            let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = reader
                    .read(&mut chunk)
                    .await
                    .map_err(crate::Error::new_body_write)?;
                if n == 0 {
                    conn.write_slice(b"0\r\n\r\n");
                    return Ok(());
                }
                let hex = format!("{:x}\r\n", n);
                conn.write_slice(hex.as_bytes());
                conn.write_binary(Bytes::copy_from_slice(&chunk[..n]));
                conn.write_slice(b"\r\n");
                if !conn.can_buffer() {
                    conn.flush().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use tokio::io::AsyncReadExt;

    async fn written(conn: &mut Conn, other: &mut tokio::io::DuplexStream) -> Vec<u8> {
        conn.flush().await.unwrap();
        let mut out = vec![0u8; 64 * 1024];
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), other.read(&mut out))
            .await
            .unwrap()
            .unwrap();
        out.truncate(n);
        out
    }

    #[tokio::test]
    async fn response_with_buffered_body() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut conn = Conn::new(a);
        let mut resp = Response::new();
        resp.set_body("/test");
        write_response(&mut conn, &mut resp, false).await.unwrap();
        let out = written(&mut conn, &mut b).await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\n/test"));
    }

    #[tokio::test]
    async fn head_suppresses_body_keeps_length() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut conn = Conn::new(a);
        let mut resp = Response::new();
        resp.set_body("payload");
        write_response(&mut conn, &mut resp, true).await.unwrap();
        let text = String::from_utf8(written(&mut conn, &mut b).await).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n"), "no body bytes: {}", text);
    }

    #[tokio::test]
    async fn no_content_drops_framing() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut conn = Conn::new(a);
        let mut resp = Response::new();
        resp.set_status(StatusCode::NO_CONTENT);
        resp.set_body("oops");
        write_response(&mut conn, &mut resp, false).await.unwrap();
        let text = String::from_utf8(written(&mut conn, &mut b).await).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn unknown_len_reader_is_chunked() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut conn = Conn::new(a);
        let mut resp = Response::new();
        resp.set_body(Body::chunked_reader(std::io::Cursor::new(
            b"streamed".to_vec(),
        )));
        write_response(&mut conn, &mut resp, false).await.unwrap();
        let text = String::from_utf8(written(&mut conn, &mut b).await).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("8\r\nstreamed\r\n0\r\n\r\n"), "{}", text);
    }

    #[tokio::test]
    async fn request_head_includes_host_from_uri() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut conn = Conn::new(a);
        let mut req = Request::new(
            http::Method::POST,
            http::Uri::from_static("http://svc.local:8080/hey?x=1"),
        );
        req.set_body("hi");
        write_request(&mut conn, &mut req).await.unwrap();
        let text = String::from_utf8(written(&mut conn, &mut b).await).unwrap();
        assert!(text.starts_with("POST /hey?x=1 HTTP/1.1\r\n"), "{}", text);
        assert!(text.contains("Host: svc.local:8080\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }
}
