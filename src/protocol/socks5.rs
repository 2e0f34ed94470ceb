//! SOCKS5 Protocol implementation
//!
//! Server side of RFC 1928, no-auth only, CONNECT only. The sniffer has
//! already consumed the version byte when `handshake` runs.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::Stream;
use crate::error::{Error, Result};

use super::{Handshake, ProxyMode};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Reply frame with an all-zero IPv4 bound address.
pub fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Run the SOCKS5 server handshake and return the CONNECT target.
///
/// The success/failure reply for the request itself is written later by the
/// tunnel engine, once the gateway has answered.
pub async fn handshake(mut stream: Stream) -> Result<Handshake> {
    // Method negotiation: NMETHODS + METHODS, reply no-auth.
    let mut nmethods = [0u8; 1];
    stream.read_exact(&mut nmethods).await?;
    let mut methods = vec![0u8; nmethods[0] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "invalid SOCKS version in request: {:#04x}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
        return Err(Error::Protocol(format!(
            "unsupported SOCKS5 command: {:#04x}",
            header[1]
        )));
    }

    let atyp = header[3];
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8_lossy(&domain).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        _ => {
            stream.write_all(&reply(REP_ATYP_NOT_SUPPORTED)).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {:#04x}",
                atyp
            )));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    let target = if atyp == ATYP_IPV6 {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    Ok(Handshake {
        mode: ProxyMode::Socks5,
        target,
        first_frame: Vec::new(),
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(input: &[u8]) -> (Result<Handshake>, tokio::io::DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(input).await.unwrap();
        let result = handshake(Box::new(server)).await;
        (result, client)
    }

    #[tokio::test]
    async fn test_connect_to_domain() {
        // NMETHODS=1 [no-auth], then CONNECT example.com:443
        let mut input = vec![0x01, 0x00];
        input.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
        input.push(11);
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());

        let (result, mut client) = run(&input).await;
        let hs = result.unwrap();
        assert_eq!(hs.mode, ProxyMode::Socks5);
        assert_eq!(hs.target, "example.com:443");
        assert!(hs.first_frame.is_empty());

        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_connect_to_ipv6_brackets_target() {
        let mut input = vec![0x01, 0x00];
        input.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV6]);
        input.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        input.extend_from_slice(&443u16.to_be_bytes());

        let (result, _client) = run(&input).await;
        assert_eq!(result.unwrap().target, "[::1]:443");
    }

    #[tokio::test]
    async fn test_connect_to_ipv4() {
        let mut input = vec![0x01, 0x00];
        input.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
        input.extend_from_slice(&[10, 0, 0, 1]);
        input.extend_from_slice(&8080u16.to_be_bytes());

        let (result, _client) = run(&input).await;
        assert_eq!(result.unwrap().target, "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let mut input = vec![0x01, 0x00];
        input.extend_from_slice(&[SOCKS5_VERSION, 0x02, 0x00, ATYP_IPV4]);
        input.extend_from_slice(&[127, 0, 0, 1]);
        input.extend_from_slice(&80u16.to_be_bytes());

        let (result, mut client) = run(&input).await;
        assert!(result.is_err());

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(&replies[2..], &reply(REP_CMD_NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let input = vec![0x01, 0x00, SOCKS5_VERSION, CMD_CONNECT, 0x00, 0x02];
        let (result, mut client) = run(&input).await;
        assert!(result.is_err());

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[2..], &reply(REP_ATYP_NOT_SUPPORTED));
    }

    #[test]
    fn test_success_reply_framing() {
        assert_eq!(
            reply(REP_SUCCESS),
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
