//! WebSocket Session implementation
//!
//! Dials `wss://host:port/path` over the ECH TLS layer and performs the
//! client handshake. The auth token, when present, is offered as the only
//! `Sec-WebSocket-Protocol` value. Dial attempts that fail on ECH trigger a
//! config refresh before the next try.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        protocol::WebSocketConfig,
    },
    WebSocketStream,
};
use tracing::{debug, info};

use crate::config::ServerEndpoint;
use crate::ech::EchStore;
use crate::error::{Error, Result};

use super::tls::EchDialer;

/// Established gateway session
pub type WsStream = WebSocketStream<TlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// WebSocket dialer for the gateway
pub struct WsDialer {
    endpoint: ServerEndpoint,
    token: String,
    tls: EchDialer,
    ech: Arc<EchStore>,
}

impl WsDialer {
    pub fn new(
        endpoint: ServerEndpoint,
        token: String,
        server_ip: Option<IpAddr>,
        ech: Arc<EchStore>,
    ) -> Self {
        let tls = EchDialer::new(endpoint.host.clone(), endpoint.port, server_ip);
        Self {
            endpoint,
            token,
            tls,
            ech,
        }
    }

    /// Dial with up to `max_retries` attempts. An attempt failing on ECH
    /// (rejection or unusable config) refreshes the store and retries after
    /// a short pause.
    pub async fn dial(&self, max_retries: u32) -> Result<WsStream> {
        for attempt in 1..=max_retries {
            let ech_list = match self.ech.get() {
                Ok(list) => list,
                Err(e) => {
                    if attempt < max_retries {
                        let _ = self.ech.refresh().await;
                        continue;
                    }
                    return Err(e);
                }
            };

            match self.dial_once(ech_list).await {
                Ok(ws) => return Ok(ws),
                Err(e) => {
                    if attempt < max_retries && e.to_string().contains("ECH") {
                        info!(
                            "ECH dial failed, refreshing config ({}/{}): {}",
                            attempt, max_retries, e
                        );
                        let _ = self.ech.refresh().await;
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(Error::MaxRetriesExceeded)
    }

    async fn dial_once(&self, ech_list: Vec<u8>) -> Result<WsStream> {
        let tls_stream = self.tls.connect(ech_list).await?;

        let authority = if self.endpoint.host.contains(':') {
            format!("[{}]:{}", self.endpoint.host, self.endpoint.port)
        } else {
            format!("{}:{}", self.endpoint.host, self.endpoint.port)
        };
        let uri = format!("wss://{}{}", authority, self.endpoint.path);
        debug!("WebSocket handshake with {}", uri);

        let mut request = Request::builder()
            .uri(uri.as_str())
            .header("Host", authority.as_str())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());

        if !self.token.is_empty() {
            request = request.header("Sec-WebSocket-Protocol", self.token.as_str());
        }

        let request = request
            .body(())
            .map_err(|e| Error::Dial(format!("failed to build WebSocket request: {}", e)))?;

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            ..Default::default()
        };

        let (ws_stream, _response) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            client_async_with_config(request, tls_stream, Some(ws_config)),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Dial(format!("WebSocket handshake failed: {}", e)))?;

        Ok(ws_stream)
    }
}
