//! # Backend Dispatch
//!
//! The agent's per-request handler (§4.5): deserializes a tunneled HTTP
//! request, looks up the backend for its routing key, rewrites the
//! request onto that backend, performs a plain TCP HTTP/1.1 call, and
//! serializes the raw response back to canonical wire form.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunnel_protocol::frame::Frame;
use tunnel_protocol::http_wire::{self, HttpRequestWire, HttpResponseWire};

use crate::error::AgentError;
use crate::rules::Rules;

/// Upper bound on how long a single backend response may take to become
/// complete, whether that completion is detected by `Content-Length`, a
/// chunked terminator, or (last resort) connection close. Without this a
/// keep-alive backend that finishes a chunked or close-delimited body but
/// leaves the socket open would hang the exchange forever.
const BACKEND_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one tunneled exchange end to end. Never propagates an error to
/// the caller: any failure short of a tunnel-write problem is encoded as
/// an HTTP response frame (matching §4.5's "terminal for the exchange,
/// not the tunnel" policy), since the gateway expects exactly one
/// Retransmit frame per request it sent.
pub async fn handle_exchange(rules: &Rules, key: String, id: String, body: Vec<u8>) -> Frame {
    let response_wire = match dispatch(rules, &key, &body).await {
        Ok(wire) => wire,
        Err(e) => {
            warn!(%key, %id, error = %e, "backend exchange failed");
            http_wire::write_response(&bad_gateway(&e))
        }
    };

    Frame::Retransmit {
        key,
        id,
        body: response_wire,
    }
}

async fn dispatch(rules: &Rules, key: &str, body: &[u8]) -> Result<Vec<u8>, AgentError> {
    let request = http_wire::parse_request(body)?;

    let backend = rules
        .backend_for(key)
        .ok_or_else(|| AgentError::NoRule(key.to_string()))?;
    let backend_url = url::Url::parse(backend)
        .map_err(|e| AgentError::Rules(format!("invalid backend url {}: {}", backend, e)))?;

    let rewritten = rewrite_request(&request, &backend_url);

    let host = backend_url
        .host_str()
        .ok_or_else(|| AgentError::Rules(format!("backend url missing host: {}", backend_url)))?;
    let port = backend_url.port_or_known_default().unwrap_or(80);

    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| AgentError::BackendDial { key: key.to_string(), source: e })?;

    stream.write_all(&http_wire::write_request(&rewritten)).await?;
    stream.flush().await?;

    read_full_response(&mut stream).await
}

/// Points the request at the backend: scheme/host/path come from the
/// rule's URL, query string (if any) from the original inbound request
/// is preserved, and `Host` is rewritten to match.
fn rewrite_request(original: &HttpRequestWire, backend_url: &url::Url) -> HttpRequestWire {
    let query = original
        .path
        .split_once('?')
        .map(|(_, q)| format!("?{q}"))
        .unwrap_or_default();
    let path = format!("{}{}", backend_url.path(), query);

    let mut headers: Vec<(String, String)> = original
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
        .cloned()
        .collect();
    let host_value = match backend_url.port() {
        Some(p) => format!("{}:{}", backend_url.host_str().unwrap_or_default(), p),
        None => backend_url.host_str().unwrap_or_default().to_string(),
    };
    headers.push(("host".to_string(), host_value));

    HttpRequestWire {
        method: original.method.clone(),
        path,
        version_minor: original.version_minor,
        headers,
        body: original.body.clone(),
    }
}

fn has_content_length(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-length"))
}

/// A chunked body is complete once its terminating zero-length chunk has
/// arrived: a `0` chunk-size line followed by a blank line (trailers, if
/// any, precede that blank line but still end with it).
fn chunked_body_complete(body: &[u8]) -> bool {
    body.ends_with(b"0\r\n\r\n")
}

/// Reads a complete HTTP response from a single-shot backend connection,
/// bounded by [`BACKEND_RESPONSE_TIMEOUT`].
///
/// - `Content-Length` present: stop once that many body bytes have arrived.
/// - `Transfer-Encoding: chunked`: stop once the terminating chunk has
///   arrived. This does NOT read to EOF — an ordinary keep-alive backend
///   leaves the socket open after a chunked response, so waiting for
///   close would hang the exchange.
/// - Neither header present: fall back to reading until the backend
///   closes the connection (close-delimited body).
async fn read_full_response(stream: &mut TcpStream) -> Result<Vec<u8>, AgentError> {
    tokio::time::timeout(BACKEND_RESPONSE_TIMEOUT, read_full_response_inner(stream))
        .await
        .map_err(|_| AgentError::TunnelRead("backend response did not complete in time".into()))?
}

async fn read_full_response_inner(stream: &mut TcpStream) -> Result<Vec<u8>, AgentError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match http_wire::parse_response(&buf) {
            Ok(parsed) if has_content_length(&parsed.headers) => return Ok(buf),
            Ok(parsed) if http_wire::is_chunked(&parsed.headers) => {
                if chunked_body_complete(&parsed.body) {
                    return Ok(buf);
                }
            }
            Ok(_) => {} // close-delimited body; keep reading to EOF
            Err(tunnel_protocol::ProtocolError::IncompleteHttp) => {}
            Err(e) => return Err(e.into()),
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if http_wire::parse_response(&buf).is_ok() {
                return Ok(buf);
            }
            return Err(AgentError::TunnelRead(
                "backend closed connection before a complete response arrived".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        debug!(bytes_so_far = buf.len(), "reading backend response");
    }
}

fn bad_gateway(err: &AgentError) -> HttpResponseWire {
    let body = format!("bad gateway: {err}");
    HttpResponseWire {
        status: 502,
        reason: "Bad Gateway".to_string(),
        version_minor: 1,
        headers: vec![("content-type".to_string(), "text/plain".to_string())],
        body: body.into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rules_with(key: &str, backend: &str) -> Rules {
        let mut routes = HashMap::new();
        routes.insert(key.to_string(), backend.to_string());
        Rules { routes }
    }

    #[test]
    fn rewrite_preserves_query_and_sets_host() {
        let original = HttpRequestWire {
            method: "GET".to_string(),
            path: "/hello?x=1".to_string(),
            version_minor: 1,
            headers: vec![("host".to_string(), "gateway.example".to_string())],
            body: vec![],
        };
        let backend = url::Url::parse("http://127.0.0.1:9000/svc").unwrap();
        let rewritten = rewrite_request(&original, &backend);
        assert_eq!(rewritten.path, "/svc?x=1");
        assert!(rewritten
            .headers
            .iter()
            .any(|(k, v)| k == "host" && v == "127.0.0.1:9000"));
    }

    #[tokio::test]
    async fn missing_rule_yields_bad_gateway_frame() {
        let rules = rules_with("/known", "http://127.0.0.1:1");
        let frame = handle_exchange(&rules, "/unknown".to_string(), "id-1".to_string(), vec![])
            .await;
        match frame {
            Frame::Retransmit { body, .. } => {
                let parsed = http_wire::parse_response(&body).unwrap();
                assert_eq!(parsed.status, 502);
            }
            _ => panic!("expected retransmit"),
        }
    }

    #[test]
    fn chunked_body_complete_detects_terminal_chunk() {
        assert!(chunked_body_complete(b"4\r\ntest\r\n0\r\n\r\n"));
        assert!(!chunked_body_complete(b"4\r\ntest\r\n"));
        assert!(!chunked_body_complete(b""));
    }

    /// The scenario the chunked fix targets: an ordinary HTTP/1.1 backend
    /// that replies with a chunked body and then keeps the connection open
    /// (real keep-alive behavior, not a hypothetical). Reading to EOF would
    /// hang forever; `read_full_response` must return as soon as the
    /// terminating chunk arrives.
    #[tokio::test]
    async fn read_full_response_stops_at_chunk_terminator_on_keep_alive_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\ntest\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
            // Deliberately never close or write anything else — a real
            // keep-alive backend holding the socket open.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let body = tokio::time::timeout(Duration::from_secs(2), read_full_response(&mut client))
            .await
            .expect("read_full_response must not hang past the chunk terminator")
            .unwrap();

        let parsed = http_wire::parse_response(&body).unwrap();
        assert_eq!(parsed.status, 200);
        assert!(chunked_body_complete(&parsed.body));

        server.abort();
    }
}
