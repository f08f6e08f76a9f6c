#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gale::{Engine, ServerOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Options bound to an ephemeral local port.
pub fn test_options() -> ServerOptions {
    let mut opts = ServerOptions::default();
    opts.address = "127.0.0.1:0".to_owned();
    opts
}

/// Starts serving in the background and returns the engine handle plus the
/// bound address.
pub async fn start(engine: Engine) -> (Arc<Engine>, SocketAddr) {
    let shared = engine.into_shared();
    let serving = shared.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    for _ in 0..500 {
        if let Some(addr) = shared.local_addr() {
            return (shared, addr);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("server did not start");
}

/// Writes raw bytes on a fresh connection and reads until the peer closes.
pub async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(request).await.expect("write");
    let mut out = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut out)).await;
    match read {
        Ok(Ok(_)) => out,
        _ => out,
    }
}

/// Sends one GET with `Connection: close` and returns the response text.
pub async fn get_text(addr: SocketAddr, path: &str) -> String {
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n",
        path
    );
    String::from_utf8_lossy(&send_raw(addr, req.as_bytes()).await).into_owned()
}

/// Reads one HTTP/1.1 response with a Content-Length body off `stream`.
pub async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
            .await
            .expect("response timeout")
            .expect("read");
        assert!(n > 0, "connection closed mid-response");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head_end) = find_head_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
            let content_length = head
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + content_length {
                return String::from_utf8_lossy(&buf[..head_end + content_length]).into_owned();
            }
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
