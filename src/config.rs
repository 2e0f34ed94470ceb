//! Client configuration
//!
//! Immutable after construction; the embedder fills in the gateway address
//! and token, everything else has working defaults.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};

/// Default DNS endpoint for the ECH bootstrap (DoH form).
pub const DEFAULT_DNS_SERVER: &str = "dns.alidns.com/dns-query";

/// Default domain whose HTTPS record publishes the ECH config list.
pub const DEFAULT_ECH_DOMAIN: &str = "cloudflare-ech.com";

/// Default local listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1080";

/// Proxy client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway authority plus optional path (e.g. "gw.example.com:443/ws")
    pub server_addr: String,

    /// Optional pinned IP; the TCP dial goes here while SNI and certificate
    /// validation keep using the hostname from `server_addr`
    #[serde(default)]
    pub server_ip: Option<IpAddr>,

    /// Opaque auth token, offered as the WebSocket subprotocol when non-empty
    #[serde(default)]
    pub token: String,

    /// DNS endpoint: "host:port" selects classic UDP, anything else DoH
    #[serde(default = "default_dns_server")]
    pub dns_server: String,

    /// Domain queried for the HTTPS record carrying the ECH config list
    #[serde(default = "default_ech_domain")]
    pub ech_domain: String,
}

fn default_dns_server() -> String {
    DEFAULT_DNS_SERVER.to_string()
}

fn default_ech_domain() -> String {
    DEFAULT_ECH_DOMAIN.to_string()
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the gateway
    /// address and token.
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_ip: None,
            token: token.into(),
            dns_server: default_dns_server(),
            ech_domain: default_ech_domain(),
        }
    }

    /// Builder: pin the gateway TCP dial to a fixed IP
    pub fn with_server_ip(mut self, ip: IpAddr) -> Self {
        self.server_ip = Some(ip);
        self
    }

    /// Builder: override the DNS endpoint used for the ECH bootstrap
    pub fn with_dns_server(mut self, dns_server: impl Into<String>) -> Self {
        self.dns_server = dns_server.into();
        self
    }

    /// Builder: override the ECH query domain
    pub fn with_ech_domain(mut self, ech_domain: impl Into<String>) -> Self {
        self.ech_domain = ech_domain.into();
        self
    }

    /// Validate the configuration, returning the parsed gateway endpoint.
    pub fn validate(&self) -> Result<ServerEndpoint> {
        if self.server_addr.is_empty() {
            return Err(Error::Config("server address is required".into()));
        }
        parse_server_addr(&self.server_addr)
    }
}

/// Parsed form of `server_addr`: host, port, and WebSocket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// Parse "host:port[/path]" into its parts. The path defaults to "/";
/// IPv6 hosts use the bracketed form ("[::1]:443").
pub fn parse_server_addr(addr: &str) -> Result<ServerEndpoint> {
    let (authority, path) = match addr.find('/') {
        Some(idx) => (&addr[..idx], addr[idx..].to_string()),
        None => (addr, "/".to_string()),
    };

    let (host, port) = split_host_port(authority)
        .ok_or_else(|| Error::Config(format!("invalid server address: {}", addr)))?;

    Ok(ServerEndpoint {
        host: host.to_string(),
        port,
        path,
    })
}

/// Validate a server address string without constructing a client.
pub fn validate_server_addr(addr: &str) -> Result<()> {
    if addr.is_empty() {
        return Err(Error::Config("server address is required".into()));
    }
    parse_server_addr(addr).map(|_| ())
}

/// Split "host:port" with support for bracketed IPv6 literals. Returns None
/// when there is no explicit, parseable port.
pub fn split_host_port(authority: &str) -> Option<(&str, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        // "[v6]:port"
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host, port));
    }

    let (host, port) = authority.rsplit_once(':')?;
    // A second colon means an unbracketed IPv6 literal, not host:port.
    if host.contains(':') || host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}
