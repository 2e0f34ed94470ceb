//! TLS StreamLayer with Encrypted Client Hello
//!
//! Builds a TLS 1.3 client configuration around the current ECH config list
//! and dials the gateway. ECH is mandatory: a server that rejects it with
//! retry configs fails the handshake instead of falling back to cleartext
//! SNI. An optional pinned IP redirects the TCP dial while SNI and
//! certificate validation keep using the hostname.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::{EchConfig, EchMode};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{EchConfigListBytes, ServerName};
use rustls::{ClientConfig, NamedGroup, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use crate::error::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS dialer for the gateway endpoint
pub struct EchDialer {
    server_name: String,
    port: u16,
    server_ip: Option<IpAddr>,
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
}

impl EchDialer {
    pub fn new(server_name: impl Into<String>, port: u16, server_ip: Option<IpAddr>) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        Self {
            server_name: server_name.into(),
            port,
            server_ip,
            provider: Arc::new(build_provider()),
            roots,
        }
    }

    /// TCP connect (pinned IP or hostname) followed by the ECH handshake.
    pub async fn connect(&self, ech_list: Vec<u8>) -> Result<TlsStream<TcpStream>> {
        let config = self.build_client_config(ech_list)?;
        let connector = TlsConnector::from(config);

        let server_name = ServerName::try_from(self.server_name.clone())
            .map_err(|_| Error::Config(format!("invalid server name: {}", self.server_name)))?;

        let tcp = match self.server_ip {
            Some(ip) => {
                let addr = SocketAddr::new(ip, self.port);
                debug!("dialing pinned {} for {}", addr, self.server_name);
                tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await
            }
            None => {
                tokio::time::timeout(
                    DIAL_TIMEOUT,
                    TcpStream::connect((self.server_name.as_str(), self.port)),
                )
                .await
            }
        }
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Dial(format!("TCP connect failed: {}", e)))?;
        tcp.set_nodelay(true)?;

        let tls_stream = tokio::time::timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(classify_tls_error)?;

        Ok(tls_stream)
    }

    /// TLS 1.3 client config with the ECH config list installed.
    fn build_client_config(&self, ech_list: Vec<u8>) -> Result<Arc<ClientConfig>> {
        let suites = rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;
        let ech_config = EchConfig::new(EchConfigListBytes::from(ech_list), suites)
            .map_err(|e| Error::Tls(format!("invalid ECH config list: {}", e)))?;

        // EchMode::Enable implies TLS 1.3 and turns a server-side ECH
        // rejection into a handshake failure.
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_ech(EchMode::Enable(ech_config))
            .map_err(|e| Error::Tls(format!("ECH setup failed: {}", e)))?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();

        Ok(Arc::new(config))
    }
}

/// Surface ECH rejections distinctly so the dial retry loop can treat them
/// as a stale config list.
fn classify_tls_error(e: std::io::Error) -> Error {
    let detail = e
        .get_ref()
        .map(|inner| format!("{:?}", inner))
        .unwrap_or_default();
    if detail.to_ascii_lowercase().contains("ech") {
        Error::Tls(format!("server rejected ECH: {}", e))
    } else {
        Error::Tls(format!("TLS handshake failed: {}", e))
    }
}

/// aws-lc-rs provider (carries the HPKE suites ECH needs), without the
/// ML-KEM hybrid key-exchange groups.
fn build_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.kx_groups = provider
        .kx_groups
        .into_iter()
        .filter(|group| {
            !matches!(
                group.name(),
                NamedGroup::X25519MLKEM768
                    | NamedGroup::secp256r1MLKEM768
                    | NamedGroup::MLKEM768
            )
        })
        .collect();
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ech_error_classification() {
        let rejected = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::General("EncryptedClientHello rejected".into()),
        );
        let err = classify_tls_error(rejected);
        assert!(err.to_string().contains("ECH"));

        let plain = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = classify_tls_error(plain);
        assert!(!err.to_string().contains("rejected ECH"));
    }

    #[test]
    fn test_invalid_ech_list_is_a_tls_error() {
        let dialer = EchDialer::new("gw.example.com", 443, None);
        let err = dialer.build_client_config(vec![0x00]).unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }
}
