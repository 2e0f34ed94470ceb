//! DNS HTTPS-record query for the ECH bootstrap
//!
//! Builds a raw RFC 1035 query for RR type 65 (HTTPS, RFC 9460), sends it
//! over one-shot UDP or DoH depending on the configured endpoint shape, and
//! walks the answer for SvcParamKey 5 (`ech`).
//!
//! Malformed or empty answers are not hard errors here; they surface as
//! `Ok(None)` and the caller decides whether a missing config is fatal.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::split_host_port;
use crate::error::{Error, Result};

/// DNS RR type for HTTPS records (RFC 9460)
pub const TYPE_HTTPS: u16 = 65;

/// SvcParamKey carrying the ECH config list
const SVC_PARAM_ECH: u16 = 5;

/// One-shot UDP receive buffer; no truncation/TCP fallback
const UDP_BUFFER_SIZE: usize = 4096;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Query the HTTPS record of `domain` and extract the ECH config list,
/// base64-encoded. Endpoint dispatch: an explicit `host:port` means classic
/// UDP DNS, anything else is a DoH URL (scheme defaulted to https).
pub async fn query_https_record(domain: &str, dns_server: &str) -> Result<Option<String>> {
    let query = build_query(domain, TYPE_HTTPS);

    let response = if split_host_port(dns_server).is_some() {
        debug!("querying HTTPS record for {} via UDP {}", domain, dns_server);
        query_udp(&query, dns_server).await?
    } else {
        let url = if dns_server.starts_with("http://") || dns_server.starts_with("https://") {
            dns_server.to_string()
        } else {
            format!("https://{}", dns_server)
        };
        debug!("querying HTTPS record for {} via DoH {}", domain, url);
        query_doh(query, &url).await?
    };

    Ok(parse_response(&response))
}

/// Build a DNS wire query: fixed header (ID=1, RD set, QDCOUNT=1), the
/// dotted domain as length-prefixed labels, then QTYPE and QCLASS IN.
pub fn build_query(domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(512);
    query.extend_from_slice(&[
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]);
    for label in domain.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);
    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query
}

async fn query_udp(query: &[u8], dns_server: &str) -> Result<Vec<u8>> {
    let bind_addr = match dns_server.parse::<std::net::SocketAddr>() {
        Ok(addr) if addr.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(dns_server).await?;
    socket.send(query).await?;

    let mut response = vec![0u8; UDP_BUFFER_SIZE];
    let n = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut response))
        .await
        .map_err(|_| Error::Timeout)??;
    response.truncate(n);
    Ok(response)
}

async fn query_doh(query: Vec<u8>, url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(QUERY_TIMEOUT)
        .build()
        .map_err(|e| Error::Bootstrap(format!("failed to build DoH client: {}", e)))?;

    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
        .header(reqwest::header::ACCEPT, "application/dns-message")
        .body(query)
        .send()
        .await
        .map_err(|e| Error::Bootstrap(format!("DoH request failed: {}", e)))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::Bootstrap(format!(
            "DoH response status: {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Bootstrap(format!("failed to read DoH response: {}", e)))?;
    Ok(body.to_vec())
}

/// Walk a DNS answer message and return the base64 ECH config list from the
/// first HTTPS record carrying SvcParamKey 5, if any.
pub fn parse_response(response: &[u8]) -> Option<String> {
    if response.len() < 12 {
        return None;
    }
    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return None;
    }

    // Skip the question: QNAME labels, then QTYPE + QCLASS.
    let mut offset = 12;
    while offset < response.len() && response[offset] != 0 {
        offset += response[offset] as usize + 1;
    }
    offset += 5;

    for _ in 0..ancount {
        offset = skip_name(response, offset)?;

        // TYPE(2) CLASS(2) TTL(4) RDLENGTH(2)
        if offset + 10 > response.len() {
            return None;
        }
        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8;
        let rdlength = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;
        if offset + rdlength > response.len() {
            return None;
        }
        let rdata = &response[offset..offset + rdlength];
        offset += rdlength;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = parse_https_rdata(rdata) {
                return Some(ech);
            }
        }
    }
    None
}

/// Skip an owner name: either a label sequence terminated by a zero octet or
/// a 2-byte compression pointer (0xC0 prefix).
fn skip_name(message: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *message.get(offset)?;
        if len & 0xC0 == 0xC0 {
            return Some(offset + 2);
        }
        if len == 0 {
            return Some(offset + 1);
        }
        offset += len as usize + 1;
    }
}

/// Parse HTTPS RDATA: skip SvcPriority and TargetName, then scan the
/// SvcParam pairs for the `ech` key.
fn parse_https_rdata(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let mut offset = skip_name(data, 2)?;

    while offset + 4 <= data.len() {
        let key = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;
        if offset + length > data.len() {
            return None;
        }
        let value = &data[offset..offset + length];
        offset += length;

        if key == SVC_PARAM_ECH {
            return Some(BASE64.encode(value));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a synthetic HTTPS-record answer to our own query layout.
    fn synthetic_answer(rdata: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        // Header: ID=1, QR+RD+RA flags, QDCOUNT=1, ANCOUNT=1
        msg.extend_from_slice(&[
            0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ]);
        // Question: example.com HTTPS IN
        msg.extend_from_slice(b"\x07example\x03com\x00");
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        // Answer: compressed owner name pointing at the question
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(rdata);
        msg
    }

    fn https_rdata(params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&1u16.to_be_bytes()); // SvcPriority
        rdata.push(0x00); // root TargetName
        for (key, value) in params {
            rdata.extend_from_slice(&key.to_be_bytes());
            rdata.extend_from_slice(&(value.len() as u16).to_be_bytes());
            rdata.extend_from_slice(value);
        }
        rdata
    }

    #[test]
    fn test_build_query_wire_format() {
        let query = build_query("example.com", TYPE_HTTPS);
        assert_eq!(
            &query[..12],
            &[0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(&query[12..25], b"\x07example\x03com\x00");
        assert_eq!(&query[25..29], &[0x00, 0x41, 0x00, 0x01]);
    }

    #[test]
    fn test_query_response_round_trip() {
        let ech = b"\x00\x0afake-ech-config-list".to_vec();
        let rdata = https_rdata(&[(1, b"\x02h2"), (5, &ech)]);
        let answer = synthetic_answer(&rdata);

        let encoded = parse_response(&answer).expect("ech param present");
        assert_eq!(BASE64.decode(encoded).unwrap(), ech);
    }

    #[test]
    fn test_parse_response_without_ech_param() {
        let rdata = https_rdata(&[(1, b"\x02h2"), (4, &[1, 2, 3, 4])]);
        let answer = synthetic_answer(&rdata);
        assert_eq!(parse_response(&answer), None);
    }

    #[test]
    fn test_parse_response_uncompressed_owner_name() {
        let ech = vec![0xAA; 16];
        let rdata = https_rdata(&[(5, &ech)]);

        let mut msg = Vec::new();
        msg.extend_from_slice(&[
            0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ]);
        msg.extend_from_slice(b"\x07example\x03com\x00");
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(b"\x07example\x03com\x00");
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        msg.extend_from_slice(&rdata);

        let encoded = parse_response(&msg).expect("ech param present");
        assert_eq!(BASE64.decode(encoded).unwrap(), ech);
    }

    #[test]
    fn test_parse_response_malformed() {
        // Too short for a header
        assert_eq!(parse_response(&[0x00, 0x01, 0x81]), None);

        // No answer records
        let mut msg = synthetic_answer(&https_rdata(&[(5, &[1, 2, 3])]));
        msg[6] = 0;
        msg[7] = 0;
        assert_eq!(parse_response(&msg), None);

        // RDATA truncated mid-record
        let rdata = https_rdata(&[(5, &[1, 2, 3, 4])]);
        let answer = synthetic_answer(&rdata);
        assert_eq!(parse_response(&answer[..answer.len() - 2]), None);
    }

    #[test]
    fn test_parse_response_skips_non_https_answers() {
        // A-record answer followed by nothing relevant
        let mut msg = Vec::new();
        msg.extend_from_slice(&[
            0x00, 0x01, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ]);
        msg.extend_from_slice(b"\x07example\x03com\x00");
        msg.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0xC0, 0x0C]);
        msg.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&60u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[127, 0, 0, 1]);
        assert_eq!(parse_response(&msg), None);
    }
}
