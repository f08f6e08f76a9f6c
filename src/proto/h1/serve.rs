//! The HTTP/1.1 per-connection server loop.
//!
//! One call to [`serve_conn`] owns a connection for its whole life and walks
//! it through `AwaitingIdle → ReadingHeader → ReadingBody → Dispatching →
//! Writing`, ending each cycle in keep-alive, close, or hijack. The context
//! is reset, not recreated, between keep-alive requests.

use bytes::Bytes;
use http::{Method, StatusCode, Version};
use tracing::{debug, trace};

use crate::body::Body;
use crate::common::BoxFuture;
use crate::context::Context;
use crate::engine::Engine;
use crate::error::Parse;
use crate::headers;
use crate::netio::Conn;
use crate::protocol::{ProtocolServer, PROTOCOL_HTTP1};
use crate::tracer;

use super::decode::Decoder;
use super::encode;
use super::parse::{self, BodyLength};

/// Ceiling on buffered head bytes before a request is rejected as too large.
const MAX_HEAD_SIZE: usize = 8192 + 4096 * 100;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The built-in HTTP/1.1 protocol server.
pub struct Http1Server {
    _priv: (),
}

impl Http1Server {
    pub fn new() -> Http1Server {
        Http1Server { _priv: () }
    }
}

impl Default for Http1Server {
    fn default() -> Http1Server {
        Http1Server::new()
    }
}

impl ProtocolServer for Http1Server {
    fn protocol(&self) -> &'static str {
        PROTOCOL_HTTP1
    }

    fn serve<'a>(&'a self, engine: &'a Engine, conn: Conn) -> BoxFuture<'a, crate::Result<()>> {
        Box::pin(serve_conn(engine, conn))
    }
}

/// Serves every request on `conn` until close, error, or hijack.
pub(crate) async fn serve_conn(engine: &Engine, conn: Conn) -> crate::Result<()> {
    let mut cx = engine.acquire_context();
    cx.attach_conn(conn);

    let result = request_loop(engine, &mut cx).await;

    cx.trace_info_mut().flush_pending();
    match &result {
        Err(e) if e.is_hijacked() => {
            // The hijack handler owns (or already owned) the connection.
        }
        _ => {
            if let Some(mut conn) = cx.take_conn() {
                let _ = conn.shutdown().await;
            }
        }
    }
    engine.release_context(cx);

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_short_connection() || e.is_hijacked() => Ok(()),
        Err(e) => Err(e),
    }
}

fn conn_of<'a>(cx: &'a mut Context) -> crate::Result<&'a mut Conn> {
    cx.conn_mut()
        .ok_or_else(|| crate::Error::new_parse(Parse::Internal))
}

async fn request_loop(engine: &Engine, cx: &mut Context) -> crate::Result<()> {
    let opts = engine.options().clone();
    let mut conn_request_num: u64 = 0;

    loop {
        conn_request_num += 1;

        if conn_request_num > 1 {
            // AwaitingIdle: wait for the next request under the idle
            // deadline; a failed probe is a clean idle close.
            let conn = conn_of(cx)?;
            conn.set_read_timeout(opts.idle_timeout.or(opts.read_timeout));
            if conn.peek(4).await.is_err() {
                trace!("keep-alive connection idled out");
                return Ok(());
            }
            conn.set_read_timeout(opts.read_timeout);
        } else {
            let conn = conn_of(cx)?;
            conn.set_read_timeout(opts.read_timeout);
            conn.set_write_timeout(opts.write_timeout);
        }

        cx.trace_info_mut().start(tracer::HTTP_START);

        // ReadingHeader.
        cx.trace_info_mut().start(tracer::READ_HEADER_START);
        let parsed = match read_head(cx, opts.disable_header_names_normalizing).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                // EOF before any request bytes: graceful close.
                return Ok(());
            }
            Err(e) => {
                return fail_request(cx, e, conn_request_num).await;
            }
        };
        cx.trace_info_mut().finish(tracer::READ_HEADER_FINISH);

        let mut request = parsed.request;
        let body_length = parsed.body;

        if opts.get_only && request.method() != Method::GET {
            debug!("GET-only server rejecting {}", request.method());
            return respond_and_close(
                cx,
                StatusCode::METHOD_NOT_ALLOWED,
                Bytes::from_static(b"405 method not allowed"),
            )
            .await;
        }

        if let BodyLength::Length(n) = body_length {
            if n > opts.max_request_body_size as u64 {
                return respond_and_close(
                    cx,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Bytes::from_static(b"413 body too large"),
                )
                .await;
            }
        }

        // Expect: 100-continue.
        if request.expects_continue() {
            if let Some(ch) = engine.continue_handler() {
                if !ch(&request) {
                    debug!("continue handler rejected request");
                    return respond_and_close(
                        cx,
                        StatusCode::EXPECTATION_FAILED,
                        Bytes::new(),
                    )
                    .await;
                }
            }
            let conn = conn_of(cx)?;
            conn.write_slice(CONTINUE_RESPONSE);
            conn.flush().await?;
        }

        // ReadingBody.
        cx.trace_info_mut().start(tracer::READ_BODY_START);
        let mut decoder = Decoder::for_body(body_length);
        if opts.streaming {
            if decoder.is_some() {
                request.set_body(Body::Streamed);
            }
            cx.set_body_decoder(decoder.take());
        } else if let Some(dec) = decoder.as_mut() {
            match read_full_body(cx, dec, opts.max_request_body_size).await {
                Ok(body) => request.set_body(body),
                Err(e) => return fail_request(cx, e, conn_request_num).await,
            }
        }
        cx.trace_info_mut().finish(tracer::READ_BODY_FINISH);

        let mut connection_close =
            opts.disable_keepalive || !request.wants_keep_alive();
        let request_version = request.version();
        let head_request = request.method() == Method::HEAD;

        // Dispatching.
        cx.set_request(request);
        cx.trace_info_mut().start(tracer::SERVER_HANDLE_START);
        engine.serve_http(cx).await;
        cx.trace_info_mut().finish(tracer::SERVER_HANDLE_FINISH);

        if engine.is_shutting_down() {
            connection_close = true;
        }

        if connection_close {
            cx.response_mut()
                .headers_mut()
                .set(headers::CONNECTION, "close");
        } else if request_version != Version::HTTP_11 {
            cx.response_mut()
                .headers_mut()
                .set(headers::CONNECTION, "keep-alive");
        }

        // Writing.
        cx.trace_info_mut().start(tracer::WRITE_START);
        write_response(cx, head_request).await?;
        cx.trace_info_mut().finish(tracer::WRITE_FINISH);

        // A streamed request body not consumed by the handler is drained so
        // the next request starts at a frame boundary.
        if let Some(mut dec) = cx.take_body_decoder() {
            let conn = conn_of(cx)?;
            dec.drain(conn).await?;
        }

        cx.trace_info_mut().finish(tracer::HTTP_FINISH);

        // Hijacked.
        if cx.is_hijacked() {
            let handler = match cx.take_hijack_handler() {
                Some(h) => h,
                None => return Err(crate::Error::new_parse(Parse::Internal)),
            };
            let mut conn = match cx.take_conn() {
                Some(c) => c,
                None => return Err(crate::Error::new_parse(Parse::Internal)),
            };
            conn.set_read_timeout(None);
            trace!("handing connection to hijack handler");
            let conn = handler(conn).await;
            if let Some(mut conn) = conn {
                if !opts.keep_hijacked_conns {
                    let _ = conn.shutdown().await;
                }
            }
            return Err(crate::Error::new_hijacked());
        }

        if connection_close {
            return Err(crate::Error::new_short_connection());
        }

        conn_of(cx)?.release();
        cx.reset_without_conn();
    }
}

/// Parses a request head off the connection, filling as needed.
///
/// `Ok(None)` means the peer closed cleanly before sending anything.
async fn read_head(
    cx: &mut Context,
    disable_normalizing: bool,
) -> crate::Result<Option<parse::ParsedRequest>> {
    let conn = conn_of(cx)?;
    loop {
        if let Some(parsed) = parse::parse_request(conn.buffered(), disable_normalizing)? {
            conn.skip(parsed.consumed);
            conn.release();
            return Ok(Some(parsed));
        }
        if conn.len() > MAX_HEAD_SIZE {
            return Err(crate::Error::new_too_large());
        }
        if conn.fill_more().await? == 0 {
            if conn.is_empty() {
                return Ok(None);
            }
            return Err(crate::Error::new_incomplete());
        }
    }
}

async fn read_full_body(
    cx: &mut Context,
    dec: &mut Decoder,
    max_size: usize,
) -> crate::Result<Body> {
    let conn = conn_of(cx)?;
    let mut chunks = Vec::new();
    let mut total = 0usize;
    loop {
        let chunk = dec.decode(conn).await?;
        if chunk.is_empty() && dec.is_done() {
            break;
        }
        total += chunk.len();
        if total > max_size {
            return Err(crate::Error::new_too_large());
        }
        chunks.push(chunk);
    }
    Ok(Body::Bytes(crate::common::buf::to_bytes(chunks)))
}

/// Writes the response, honoring a hijack writer when one is installed.
async fn write_response(cx: &mut Context, head_request: bool) -> crate::Result<()> {
    if cx.response().has_hijack_writer() {
        let mut writer = match cx.response_mut().take_hijack_writer() {
            Some(w) => w,
            None => return Err(crate::Error::new_parse(Parse::Internal)),
        };
        let (response, conn) = cx.response_and_conn()?;
        writer
            .write_response(response, conn)
            .await
            .map_err(|e| crate::Error::new_user_hijack(e))?;
        writer
            .finalize(conn)
            .await
            .map_err(|e| crate::Error::new_user_hijack(e))?;
        return Ok(());
    }
    let (response, conn) = cx.response_and_conn()?;
    encode::write_response(conn, response, head_request).await?;
    conn.flush().await?;
    cx.signal_finished();
    Ok(())
}

/// Maps a read failure to its wire response per the error taxonomy:
/// parse → 400, timeout → 408 (or clean close before any bytes),
/// too large → 413, closed → silent close.
async fn fail_request(
    cx: &mut Context,
    err: crate::Error,
    conn_request_num: u64,
) -> crate::Result<()> {
    if err.is_closed() || err.is_incomplete_message() {
        debug!("connection closed mid-request: {}", err);
        return Err(err);
    }
    if err.is_timeout() {
        let no_bytes = cx.conn_mut().map(|c| c.is_empty()).unwrap_or(true);
        if conn_request_num > 1 || no_bytes {
            // An idle connection timing out before any request bytes is a
            // graceful close, not a protocol failure.
            return Ok(());
        }
        return respond_and_close(cx, StatusCode::REQUEST_TIMEOUT, Bytes::new()).await;
    }
    if err.is_parse_too_large() {
        return respond_and_close(cx, StatusCode::PAYLOAD_TOO_LARGE, Bytes::new()).await;
    }
    if err.is_parse() {
        return respond_and_close(
            cx,
            StatusCode::BAD_REQUEST,
            Bytes::from_static(b"400 bad request"),
        )
        .await;
    }
    Err(err)
}

/// Writes a terse error response and signals the connection must close.
async fn respond_and_close(
    cx: &mut Context,
    status: StatusCode,
    body: Bytes,
) -> crate::Result<()> {
    {
        let resp = cx.response_mut();
        resp.reset();
        resp.set_status(status);
        resp.headers_mut().set(headers::CONNECTION, "close");
        if !body.is_empty() {
            resp.set_body(body);
        }
    }
    let (response, conn) = cx.response_and_conn()?;
    encode::write_response(conn, response, false).await?;
    conn.flush().await?;
    Err(crate::Error::new_short_connection())
}
