//! HTTP/1.1 head parsing, driven by `httparse`.

use bytes::Bytes;
use http::{Method, StatusCode, Uri, Version};
use tracing::{debug, trace};

use crate::error::Parse;
use crate::headers::{self, HeaderMap};
use crate::request::Request;

pub(crate) const MAX_HEADERS: usize = 100;

/// How the message body is framed, per RFC 7230 §3.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    Empty,
    Length(u64),
    Chunked,
    /// Responses without framing headers run until the connection closes.
    CloseDelimited,
}

#[derive(Clone, Copy)]
struct HeaderIndices {
    name: (usize, usize),
    value: (usize, usize),
}

fn record_header_indices(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    indices: &mut [HeaderIndices],
) {
    let bytes_ptr = bytes.as_ptr() as usize;
    for (header, indices) in headers.iter().zip(indices.iter_mut()) {
        let name_start = header.name.as_ptr() as usize - bytes_ptr;
        let name_end = name_start + header.name.len();
        indices.name = (name_start, name_end);
        let value_start = header.value.as_ptr() as usize - bytes_ptr;
        let value_end = value_start + header.value.len();
        indices.value = (value_start, value_end);
    }
}

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub(crate) request: Request,
    pub(crate) body: BodyLength,
    pub(crate) consumed: usize,
}

/// Parses a request head out of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the caller must
/// skip `consumed` bytes off its buffer.
pub(crate) fn parse_request(
    buf: &[u8],
    disable_normalizing: bool,
) -> crate::Result<Option<ParsedRequest>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut indices = [HeaderIndices {
        name: (0, 0),
        value: (0, 0),
    }; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    trace!("Request.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let (consumed, method, path, version, headers_len) = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            trace!("Request.parse Complete({})", len);
            let method = req
                .method
                .unwrap_or("")
                .parse::<Method>()
                .map_err(|_| crate::Error::new_parse(Parse::Method))?;
            let path = req.path.unwrap_or("");
            let version = if req.version == Some(1) {
                Version::HTTP_11
            } else {
                Version::HTTP_10
            };
            record_header_indices(buf, &req.headers, &mut indices);
            (len, method, path.to_owned(), version, req.headers.len())
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::Version) => {
            return Err(crate::Error::new_parse(Parse::Version));
        }
        Err(e) => {
            debug!("request head parse error: {}", e);
            return Err(crate::Error::new_parse(Parse::Header).with(e));
        }
    };

    let head = Bytes::copy_from_slice(&buf[..consumed]);
    let uri: Uri = path
        .parse()
        .map_err(|_| crate::Error::new_parse(Parse::Uri))?;
    let raw_path = Bytes::copy_from_slice(path.as_bytes());

    let mut map = HeaderMap::with_capacity(headers_len);
    map.set_disable_normalizing(disable_normalizing);
    for idx in &indices[..headers_len] {
        let name = &head[idx.name.0..idx.name.1];
        let name = if disable_normalizing {
            head.slice(idx.name.0..idx.name.1)
        } else {
            Bytes::from(headers::canonicalize(name))
        };
        map.add_raw(name, head.slice(idx.value.0..idx.value.1));
    }

    let body = request_body_length(&map, version)?;
    let request = Request::from_parse(method, uri, version, map, raw_path, head);
    Ok(Some(ParsedRequest {
        request,
        body,
        consumed,
    }))
}

/// Decides request body framing per RFC 7230 §3.3.3.
fn request_body_length(headers: &HeaderMap, version: Version) -> crate::Result<BodyLength> {
    let te_chunked = transfer_encoding_is_chunked(headers, version)?;
    if te_chunked {
        return Ok(BodyLength::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyLength::Empty),
        Some(n) => Ok(BodyLength::Length(n)),
    }
}

fn transfer_encoding_is_chunked(headers: &HeaderMap, version: Version) -> crate::Result<bool> {
    let mut last: Option<String> = None;
    let mut present = false;
    for value in headers.get_all(headers::TRANSFER_ENCODING) {
        present = true;
        let value = std::str::from_utf8(value)
            .map_err(|_| crate::Error::new_parse(Parse::Header))?;
        for coding in value.split(',') {
            let coding = coding.trim();
            if !coding.is_empty() {
                last = Some(coding.to_ascii_lowercase());
            }
        }
    }
    if !present {
        return Ok(false);
    }
    if version == Version::HTTP_10 {
        debug!("HTTP/1.0 message has Transfer-Encoding header");
        return Err(crate::Error::new_parse(Parse::Header));
    }
    match last.as_deref() {
        Some("chunked") => Ok(true),
        _ => {
            debug!("Transfer-Encoding present but chunked is not final");
            Err(crate::Error::new_parse(Parse::Header))
        }
    }
}

fn content_length(headers: &HeaderMap) -> crate::Result<Option<u64>> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all(headers::CONTENT_LENGTH) {
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| crate::Error::new_parse(Parse::Header))?;
        match seen {
            Some(prev) if prev != parsed => {
                debug!("multiple differing Content-Length headers");
                return Err(crate::Error::new_parse(Parse::Header));
            }
            _ => seen = Some(parsed),
        }
    }
    Ok(seen)
}

pub(crate) struct ParsedResponse {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: BodyLength,
    pub(crate) consumed: usize,
}

/// Parses a response head out of `buf`, for the client side.
pub(crate) fn parse_response(
    buf: &[u8],
    request_method: &Method,
    disable_normalizing: bool,
) -> crate::Result<Option<ParsedResponse>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut indices = [HeaderIndices {
        name: (0, 0),
        value: (0, 0),
    }; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let (consumed, code, version, headers_len) = match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let code = resp.code.ok_or_else(|| crate::Error::new_parse(Parse::Status))?;
            let version = if resp.version == Some(1) {
                Version::HTTP_11
            } else {
                Version::HTTP_10
            };
            record_header_indices(buf, &resp.headers, &mut indices);
            (len, code, version, resp.headers.len())
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::Status) => {
            return Err(crate::Error::new_parse(Parse::Status));
        }
        Err(e) => {
            debug!("response head parse error: {}", e);
            return Err(crate::Error::new_parse(Parse::Header).with(e));
        }
    };

    let status =
        StatusCode::from_u16(code).map_err(|_| crate::Error::new_parse(Parse::Status))?;
    let head = Bytes::copy_from_slice(&buf[..consumed]);
    let mut map = HeaderMap::with_capacity(headers_len);
    map.set_disable_normalizing(disable_normalizing);
    for idx in &indices[..headers_len] {
        let name = if disable_normalizing {
            head.slice(idx.name.0..idx.name.1)
        } else {
            Bytes::from(headers::canonicalize(&head[idx.name.0..idx.name.1]))
        };
        map.add_raw(name, head.slice(idx.value.0..idx.value.1));
    }

    let body = response_body_length(&map, status, request_method, version)?;
    Ok(Some(ParsedResponse {
        status,
        version,
        headers: map,
        body,
        consumed,
    }))
}

fn response_body_length(
    headers: &HeaderMap,
    status: StatusCode,
    request_method: &Method,
    version: Version,
) -> crate::Result<BodyLength> {
    if request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyLength::Empty);
    }
    if transfer_encoding_is_chunked(headers, version)? {
        return Ok(BodyLength::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyLength::Empty),
        Some(n) => Ok(BodyLength::Length(n)),
        None => Ok(BodyLength::CloseDelimited),
    }
}
