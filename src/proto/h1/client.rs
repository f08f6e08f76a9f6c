//! The HTTP/1.1 client transaction: one request/response exchange.

use http::StatusCode;
use tracing::trace;

use crate::common::buf::to_bytes;
use crate::netio::Conn;
use crate::request::Request;
use crate::response::Response;

use super::decode::Decoder;
use super::encode;
use super::parse::{self, BodyLength};

/// Ceiling on buffered response-head bytes.
const MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;

/// Runs one exchange on `conn`.
///
/// Returns whether the connection may be reused for another request.
pub(crate) async fn do_request(
    conn: &mut Conn,
    req: &mut Request,
    resp: &mut Response,
    disable_normalizing: bool,
) -> crate::Result<bool> {
    encode::write_request(conn, req).await?;
    conn.flush().await?;

    // 1xx interim responses are read and discarded; the first final head
    // wins.
    let parsed = loop {
        let head = read_head(conn, req, disable_normalizing).await?;
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            trace!("discarding interim response {}", head.status);
            continue;
        }
        break head;
    };

    resp.set_status(parsed.status);
    resp.set_version(parsed.version);
    *resp.headers_mut() = parsed.headers;

    let close_delimited = parsed.body == BodyLength::CloseDelimited;
    if let Some(mut decoder) = Decoder::for_body(parsed.body) {
        let mut chunks = Vec::new();
        loop {
            let chunk = decoder.decode(conn).await?;
            if chunk.is_empty() && decoder.is_done() {
                break;
            }
            chunks.push(chunk);
        }
        resp.set_body(to_bytes(chunks));
    }

    let reusable = !close_delimited
        && !resp.headers().connection_has("close")
        && (resp.version() == http::Version::HTTP_11
            || resp.headers().connection_has("keep-alive"));
    Ok(reusable)
}

async fn read_head(
    conn: &mut Conn,
    req: &Request,
    disable_normalizing: bool,
) -> crate::Result<parse::ParsedResponse> {
    loop {
        if let Some(parsed) =
            parse::parse_response(conn.buffered(), req.method(), disable_normalizing)?
        {
            conn.skip(parsed.consumed);
            conn.release();
            return Ok(parsed);
        }
        if conn.len() > MAX_HEAD_SIZE {
            return Err(crate::Error::new_too_large());
        }
        if conn.fill_more().await? == 0 {
            return Err(crate::Error::new_incomplete());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trip_with_content_length() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = b.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]).into_owned();
            assert!(text.starts_with("GET /ping HTTP/1.1\r\n"), "{}", text);
            b.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
                .await
                .unwrap();
            b
        });

        let mut conn = Conn::new(a);
        let mut req = Request::new(Method::GET, "http://svc/ping".parse().unwrap());
        let mut resp = Response::new();
        let reusable = do_request(&mut conn, &mut req, &mut resp, false)
            .await
            .unwrap();
        assert!(reusable);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body_bytes().unwrap().as_ref(), b"pong");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = b.read(&mut buf).await.unwrap();
            b.write_all(
                b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
            )
            .await
            .unwrap();
            // Keep the pipe open so the client is not racing an EOF.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        let mut conn = Conn::new(a);
        let mut req = Request::new(Method::POST, "http://svc/x".parse().unwrap());
        let mut resp = Response::new();
        do_request(&mut conn, &mut req, &mut resp, false)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn connection_close_marks_unreusable() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = b.read(&mut buf).await.unwrap();
            b.write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let mut conn = Conn::new(a);
        let mut req = Request::new(Method::GET, "http://svc/x".parse().unwrap());
        let mut resp = Response::new();
        let reusable = do_request(&mut conn, &mut req, &mut resp, false)
            .await
            .unwrap();
        assert!(!reusable);
    }
}
