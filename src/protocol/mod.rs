//! Inbound Protocol Layer
//!
//! Responsibilities:
//! - Protocol sniffing on the first byte of an accepted connection
//! - SOCKS5 and HTTP proxy handshakes
//! - Producing the tunnel target and any pre-buffered first frame
//!
//! This layer never touches the gateway; it only negotiates with the local
//! client and hands a `Handshake` to the tunnel engine.

mod http;
mod socks5;

pub use http::handshake as http_handshake;
pub use socks5::handshake as socks5_handshake;

use tokio::io::AsyncWriteExt;

use crate::common::Stream;
use crate::error::Result;

/// Protocol family detected from the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Socks5,
    Http,
}

/// Dispatch on the first byte of a connection: 0x05 is SOCKS5, the first
/// letters of the HTTP methods select HTTP, everything else is dropped.
/// The FSMs re-validate version/method after dispatch.
pub fn sniff(first_byte: u8) -> Option<ProtocolFamily> {
    match first_byte {
        0x05 => Some(ProtocolFamily::Socks5),
        b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => Some(ProtocolFamily::Http),
        _ => None,
    }
}

/// Proxy mode established by the inbound handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks5,
    HttpConnect,
    HttpProxy,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Socks5 => "SOCKS5",
            ProxyMode::HttpConnect => "HTTP-CONNECT",
            ProxyMode::HttpProxy => "HTTP-PROXY",
        }
    }

    /// Tell the local client the tunnel is up. HTTP forward mode stays
    /// silent: the gateway's bytes are the response.
    pub async fn write_success(&self, stream: &mut Stream) -> Result<()> {
        match self {
            ProxyMode::Socks5 => {
                stream.write_all(&socks5::reply(socks5::REP_SUCCESS)).await?;
            }
            ProxyMode::HttpConnect => {
                stream.write_all(http::RESPONSE_200_ESTABLISHED).await?;
            }
            ProxyMode::HttpProxy => {}
        }
        stream.flush().await?;
        Ok(())
    }

    /// Tell the local client the tunnel failed. Best effort; the connection
    /// is being torn down either way.
    pub async fn write_failure(&self, stream: &mut Stream) {
        let _ = match self {
            ProxyMode::Socks5 => {
                stream
                    .write_all(&socks5::reply(socks5::REP_HOST_UNREACHABLE))
                    .await
            }
            ProxyMode::HttpConnect | ProxyMode::HttpProxy => {
                stream.write_all(http::RESPONSE_502_BAD_GATEWAY).await
            }
        };
        let _ = stream.flush().await;
    }
}

/// Result of an inbound handshake, everything the tunnel engine needs.
pub struct Handshake {
    pub mode: ProxyMode,
    /// "host:port", IPv6 hosts bracketed
    pub target: String,
    /// Bytes to carry inside the gateway CONNECT message (may be empty)
    pub first_frame: Vec<u8>,
    /// The client stream, with any over-read bytes replayed first
    pub stream: Stream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_dispatch() {
        assert_eq!(sniff(0x05), Some(ProtocolFamily::Socks5));
        for byte in [b'C', b'G', b'P', b'H', b'D', b'O', b'T'] {
            assert_eq!(sniff(byte), Some(ProtocolFamily::Http));
        }
        assert_eq!(sniff(0x04), None);
        assert_eq!(sniff(b'X'), None);
        assert_eq!(sniff(0x16), None); // TLS record byte
    }
}
