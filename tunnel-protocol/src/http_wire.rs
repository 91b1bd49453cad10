//! # Canonical HTTP/1.1 Wire Form
//!
//! Serializes an HTTP request or response to the exact bytes that went
//! (or will go) over the wire, and parses them back. This is what lets
//! a `Retransmit` frame carry a request from gateway to agent and a
//! response back without either side needing to understand the payload.
//!
//! Parsing is built on `httparse` for the request/status line and
//! headers; the body is sliced out afterward using `Content-Length`.
//! Chunked transfer-encoding is not decoded here — callers that need to
//! know whether a chunked body has fully arrived (the agent's backend
//! reader, notably) detect the terminating chunk themselves and pass the
//! raw chunked bytes through unchanged, same as this module does for any
//! other body.

use crate::error::ProtocolError;

const MAX_HEADERS: usize = 64;

/// A parsed HTTP request, or the pieces needed to write one out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestWire {
    pub method: String,
    pub path: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A parsed HTTP response, or the pieces needed to write one out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseWire {
    pub status: u16,
    pub reason: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    header_value(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

/// Writes a request in canonical wire form: request line, headers in
/// order, a blank line, then the body. A `Content-Length` header is
/// appended unless the caller already supplied one, so a body is never
/// silently truncated on the reading side.
pub fn write_request(req: &HttpRequestWire) -> Vec<u8> {
    let mut out = Vec::with_capacity(req.body.len() + 256);
    out.extend_from_slice(req.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.path.as_bytes());
    out.extend_from_slice(format!(" HTTP/1.{}\r\n", req.version_minor).as_bytes());
    for (name, value) in &req.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if content_length(&req.headers).is_none() {
        out.extend_from_slice(format!("content-length: {}\r\n", req.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

/// Writes a response in canonical wire form, mirroring [`write_request`].
pub fn write_response(resp: &HttpResponseWire) -> Vec<u8> {
    let mut out = Vec::with_capacity(resp.body.len() + 256);
    out.extend_from_slice(format!("HTTP/1.{} {} ", resp.version_minor, resp.status).as_bytes());
    out.extend_from_slice(resp.reason.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &resp.headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if content_length(&resp.headers).is_none() {
        out.extend_from_slice(format!("content-length: {}\r\n", resp.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&resp.body);
    out
}

/// Parses a complete request out of its canonical wire form, including
/// the body. `httparse` locates the header block; the body is then
/// sliced using `Content-Length` (absence of the header means no body).
pub fn parse_request(buf: &[u8]) -> Result<HttpRequestWire, ProtocolError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_storage);
    let status = parsed
        .parse(buf)
        .map_err(|e| ProtocolError::MalformedHttp(e.to_string()))?;

    let header_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ProtocolError::IncompleteHttp),
    };

    let method = parsed
        .method
        .ok_or_else(|| ProtocolError::MalformedHttp("missing method".into()))?
        .to_string();
    let path = parsed
        .path
        .ok_or_else(|| ProtocolError::MalformedHttp("missing path".into()))?
        .to_string();
    let version_minor = parsed.version.unwrap_or(1) as u8;
    let headers = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect::<Vec<_>>();

    let body = slice_body(buf, header_len, &headers)?;

    Ok(HttpRequestWire {
        method,
        path,
        version_minor,
        headers,
        body,
    })
}

/// Parses a complete response out of its canonical wire form, mirroring
/// [`parse_request`].
pub fn parse_response(buf: &[u8]) -> Result<HttpResponseWire, ProtocolError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_storage);
    let status = parsed
        .parse(buf)
        .map_err(|e| ProtocolError::MalformedHttp(e.to_string()))?;

    let header_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(ProtocolError::IncompleteHttp),
    };

    let status_code = parsed
        .code
        .ok_or_else(|| ProtocolError::MalformedHttp("missing status code".into()))?;
    let reason = parsed.reason.unwrap_or("").to_string();
    let version_minor = parsed.version.unwrap_or(1) as u8;
    let headers = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect::<Vec<_>>();

    let body = slice_body(buf, header_len, &headers)?;

    Ok(HttpResponseWire {
        status: status_code,
        reason,
        version_minor,
        headers,
        body,
    })
}

fn slice_body(
    buf: &[u8],
    header_len: usize,
    headers: &[(String, String)],
) -> Result<Vec<u8>, ProtocolError> {
    let remaining = &buf[header_len..];
    match content_length(headers) {
        Some(len) => {
            if remaining.len() < len {
                return Err(ProtocolError::IncompleteHttp);
            }
            Ok(remaining[..len].to_vec())
        }
        None => Ok(remaining.to_vec()),
    }
}

/// True iff `headers` declares `Transfer-Encoding: chunked` (matched
/// case-insensitively, tolerating an additional coding like `gzip,
/// chunked`). A response flagged this way has a chunk-encoded body, not
/// a raw one, regardless of whether `Content-Length` is also present.
pub fn is_chunked(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked")
    })
}

/// Decodes a complete chunked-transfer body into its raw payload: each
/// chunk is a hex size line, the chunk's bytes, then a trailing CRLF;
/// the body ends at the zero-size chunk, after which any trailer headers
/// are discarded (this codec has no use for them).
pub fn decode_chunked(body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;

    loop {
        let line_end = find_crlf(rest).ok_or(ProtocolError::IncompleteHttp)?;
        let size_line = std::str::from_utf8(&rest[..line_end])
            .map_err(|_| ProtocolError::MalformedHttp("invalid chunk size line".into()))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProtocolError::MalformedHttp(format!("invalid chunk size: {size_str}")))?;

        rest = &rest[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }

        if rest.len() < size + 2 {
            return Err(ProtocolError::IncompleteHttp);
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
