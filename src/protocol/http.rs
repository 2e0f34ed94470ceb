//! HTTP Proxy Protocol implementation
//!
//! The proxy works in two modes:
//! - Tunnel: CONNECT method, the proxy becomes a transparent byte relay
//! - Forward: absolute-URI (or Host-based) requests are rewritten to
//!   origin form and carried to the gateway as the tunnel's first frame
//!
//! Header lines are forwarded verbatim and in order, minus the hop-by-hop
//! proxy headers (`Proxy-Connection`, `Proxy-Authorization`). A request body
//! is captured into the first frame only when Content-Length is known and
//! under the 10 MiB cap; anything larger flows through the binary copy loop.

use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::common::{PrependStream, Stream};
use crate::error::{Error, Result};

use super::{Handshake, ProxyMode};

pub const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_400_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const RESPONSE_405_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const RESPONSE_502_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const FORWARD_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

/// Bodies at or above this size are not captured into the first frame.
const MAX_BODY_IN_FIRST_FRAME: usize = 10 * 1024 * 1024;

/// Run the HTTP proxy handshake. `first_byte` was consumed by the sniffer
/// and is replayed in front of the stream.
///
/// Returns `None` when the request was already answered locally (unsupported
/// method, missing authority) and the connection should just be dropped.
pub async fn handshake(stream: Stream, first_byte: u8) -> Result<Option<Handshake>> {
    let stream: Stream = Box::new(PrependStream::new(&[first_byte][..], stream));
    let mut reader = BufReader::new(stream);

    let request_line = read_line(&mut reader).await?;
    let mut parts = request_line.split_whitespace();
    let (method, request_target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(Error::Protocol("invalid HTTP request line".into())),
    };

    // Keep the raw lines for verbatim forwarding; lowercase lookups are only
    // for Host and Content-Length.
    let mut header_lines: Vec<String> = Vec::new();
    let mut host: Option<String> = None;
    let mut content_length: Option<usize> = None;
    loop {
        let line = read_line(&mut reader).await?;
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key == "host" {
                host = Some(value.to_string());
            } else if key == "content-length" {
                content_length = value.parse().ok();
            }
        }
        header_lines.push(line);
    }

    if method == "CONNECT" {
        debug!("HTTP CONNECT {}", request_target);
        return Ok(Some(Handshake {
            mode: ProxyMode::HttpConnect,
            target: request_target,
            first_frame: Vec::new(),
            stream: into_stream(reader),
        }));
    }

    if !FORWARD_METHODS.contains(&method.as_str()) {
        debug!("HTTP method not allowed: {}", method);
        let mut stream = into_stream(reader);
        stream.write_all(RESPONSE_405_METHOD_NOT_ALLOWED).await?;
        return Ok(None);
    }

    // Authority and origin-form path: split the absolute URI, or fall back
    // to the Host header for origin-form targets.
    let (mut authority, path) = if let Some(rest) = request_target.strip_prefix("http://") {
        match rest.find('/') {
            Some(idx) if idx > 0 => (rest[..idx].to_string(), rest[idx..].to_string()),
            _ => (rest.to_string(), "/".to_string()),
        }
    } else {
        (host.unwrap_or_default(), request_target.clone())
    };

    if authority.is_empty() {
        let mut stream = into_stream(reader);
        stream.write_all(RESPONSE_400_BAD_REQUEST).await?;
        return Ok(None);
    }
    if !authority.contains(':') {
        authority.push_str(":80");
    }

    debug!("HTTP {} {} -> {}", method, request_target, authority);

    let mut frame = BytesMut::new();
    frame.extend_from_slice(format!("{} {} {}\r\n", method, path, version).as_bytes());
    for line in &header_lines {
        let key = line
            .split(':')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if key == "proxy-connection" || key == "proxy-authorization" {
            continue;
        }
        frame.extend_from_slice(line.as_bytes());
        frame.extend_from_slice(b"\r\n");
    }
    frame.extend_from_slice(b"\r\n");

    if let Some(length) = content_length {
        if length > 0 && length < MAX_BODY_IN_FIRST_FRAME {
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            frame.extend_from_slice(&body);
        }
    }

    Ok(Some(Handshake {
        mode: ProxyMode::HttpProxy,
        target: authority,
        first_frame: frame.to_vec(),
        stream: into_stream(reader),
    }))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::Protocol("unexpected end of request".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Unwrap the BufReader without losing bytes it buffered past the request
/// head; they belong to the tunnel.
fn into_stream(reader: BufReader<Stream>) -> Stream {
    let leftover = reader.buffer().to_vec();
    let inner = reader.into_inner();
    if leftover.is_empty() {
        inner
    } else {
        Box::new(PrependStream::new(&leftover[..], inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(request: &[u8]) -> (Result<Option<Handshake>>, tokio::io::DuplexStream) {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&request[1..]).await.unwrap();
        let result = handshake(Box::new(server), request[0]).await;
        (result, client)
    }

    #[tokio::test]
    async fn test_connect_request() {
        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert_eq!(hs.mode, ProxyMode::HttpConnect);
        assert_eq!(hs.target, "example.com:443");
        assert!(hs.first_frame.is_empty());
    }

    #[tokio::test]
    async fn test_get_absolute_uri_strips_proxy_headers() {
        let request = b"GET http://example.com/path HTTP/1.1\r\n\
            Host: example.com\r\n\
            Proxy-Connection: keep-alive\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert_eq!(hs.mode, ProxyMode::HttpProxy);
        assert_eq!(hs.target, "example.com:80");
        assert_eq!(
            hs.first_frame,
            b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_get_absolute_uri_without_path() {
        let request = b"GET http://example.com:8080 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert_eq!(hs.target, "example.com:8080");
        assert!(hs.first_frame.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_origin_form_uses_host_header() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert_eq!(hs.target, "example.com:80");
        assert!(hs.first_frame.starts_with(b"GET /index.html HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_origin_form_without_host_is_bad_request() {
        let request = b"GET /index.html HTTP/1.1\r\nAccept: */*\r\n\r\n";
        let (result, mut client) = run(request).await;
        assert!(result.unwrap().is_none());

        let mut response = [0u8; RESPONSE_400_BAD_REQUEST.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, RESPONSE_400_BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let request = b"FOO / HTTP/1.1\r\n\r\n";
        let (result, mut client) = run(request).await;
        assert!(result.unwrap().is_none());

        let mut response = [0u8; RESPONSE_405_METHOD_NOT_ALLOWED.len()];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, RESPONSE_405_METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_post_body_captured_in_first_frame() {
        let request = b"POST http://example.com/submit HTTP/1.1\r\n\
            Host: example.com\r\n\
            Content-Length: 5\r\n\r\nhello";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert!(hs.first_frame.ends_with(b"\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_zero_length_body_not_captured() {
        let request = b"POST http://example.com/submit HTTP/1.1\r\n\
            Host: example.com\r\n\
            Content-Length: 0\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert!(hs.first_frame.ends_with(b"Content-Length: 0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_oversized_body_left_for_the_copy_loop() {
        let request = b"POST http://example.com/upload HTTP/1.1\r\n\
            Host: example.com\r\n\
            Content-Length: 10485760\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        // The head is forwarded, the body is not captured.
        assert!(hs.first_frame.ends_with(b"Content-Length: 10485760\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_header_case_and_order_preserved() {
        let request = b"GET http://example.com/ HTTP/1.1\r\n\
            X-First: 1\r\n\
            Proxy-Authorization: Basic Zm9v\r\n\
            HOST: example.com\r\n\
            x-Second: 2\r\n\r\n";
        let (result, _client) = run(request).await;
        let hs = result.unwrap().unwrap();
        assert_eq!(
            hs.first_frame,
            b"GET / HTTP/1.1\r\nX-First: 1\r\nHOST: example.com\r\nx-Second: 2\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_pipelined_bytes_survive_into_stream() {
        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nEXTRA";
        let (result, _client) = run(request).await;
        let mut hs = result.unwrap().unwrap();

        let mut extra = [0u8; 5];
        hs.stream.read_exact(&mut extra).await.unwrap();
        assert_eq!(&extra, b"EXTRA");
    }
}
