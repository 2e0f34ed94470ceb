//! Proxy client lifecycle
//!
//! One `ProxyClient` owns a listener, the shared ECH store, and the gateway
//! dialer. Start bootstraps the ECH config, binds the listener, and spawns
//! the accept loop; Stop signals the loop and releases the port. In-flight
//! tunnels keep running until their own copy directions finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::debug;

use crate::common::{LogHandle, LogSink, Stream};
use crate::config::{ClientConfig, DEFAULT_LISTEN_ADDR};
use crate::ech::EchStore;
use crate::error::{Error, Result};
use crate::protocol::{self, ProtocolFamily};
use crate::session::WsDialer;

use super::tunnel;

/// Deadline for the first byte of an accepted connection.
const SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

enum ListenerState {
    Idle,
    Running { shutdown: broadcast::Sender<()> },
}

/// Local proxy bridging SOCKS5/HTTP clients to the WebSocket gateway
pub struct ProxyClient {
    config: ClientConfig,
    ech: Arc<EchStore>,
    dialer: Arc<WsDialer>,
    state: Mutex<ListenerState>,
    log: Arc<LogHandle>,
}

impl ProxyClient {
    /// Validate the configuration and assemble the client. No I/O happens
    /// until `start` or `test_connection`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = config.validate()?;
        let ech = Arc::new(EchStore::new(
            config.ech_domain.clone(),
            config.dns_server.clone(),
        ));
        let dialer = Arc::new(WsDialer::new(
            endpoint,
            config.token.clone(),
            config.server_ip,
            ech.clone(),
        ));

        Ok(Self {
            config,
            ech,
            dialer,
            state: Mutex::new(ListenerState::Idle),
            log: Arc::new(LogHandle::new()),
        })
    }

    /// Install or replace the log sink.
    pub fn set_log_sink(&self, sink: Arc<dyn LogSink>) {
        self.log.set(sink);
    }

    /// Bootstrap the ECH config and open the listener. A failed bootstrap
    /// aborts the start.
    pub async fn start(&self, listen_addr: &str) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        self.log.info("fetching ECH configuration...");
        self.ech.refresh().await?;

        let listen_addr = if listen_addr.is_empty() {
            DEFAULT_LISTEN_ADDR
        } else {
            listen_addr
        };
        let listener = TcpListener::bind(listen_addr).await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut state = self.state.lock();
            if matches!(*state, ListenerState::Running { .. }) {
                return Err(Error::AlreadyRunning);
            }
            *state = ListenerState::Running {
                shutdown: shutdown_tx,
            };
        }

        self.log
            .info(&format!("proxy listening on {} (SOCKS5 + HTTP)", listen_addr));
        self.log.info(&format!("gateway: {}", self.config.server_addr));
        if let Some(ip) = self.config.server_ip {
            self.log.info(&format!("pinned gateway IP: {}", ip));
        }

        let dialer = self.dialer.clone();
        let log = self.log.clone();
        tokio::spawn(accept_loop(listener, dialer, log, shutdown_rx));

        Ok(())
    }

    /// Close the listener. Idempotent failures: stopping an idle client is
    /// an error, in-flight tunnels are left alone.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ListenerState::Idle) {
            ListenerState::Idle => Err(Error::NotRunning),
            ListenerState::Running { shutdown } => {
                let _ = shutdown.send(());
                self.log.info("proxy stopped");
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ListenerState::Running { .. })
    }

    pub fn status(&self) -> &'static str {
        if self.is_running() {
            "Running"
        } else {
            "Stopped"
        }
    }

    pub fn version(&self) -> &'static str {
        crate::version()
    }

    /// One-shot connectivity check: refresh the ECH config and perform a
    /// single gateway dial, without starting the listener.
    pub async fn test_connection(&self) -> Result<()> {
        self.ech.refresh().await?;
        let ws = self.dialer.dial(1).await?;
        drop(ws);
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    dialer: Arc<WsDialer>,
    log: Arc<LogHandle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let dialer = dialer.clone();
                        let log = log.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, &dialer, &log).await {
                                if !e.is_normal_close() {
                                    log.error(&format!("connection from {} failed: {}", addr, e));
                                }
                            }
                        });
                    }
                    Err(e) => {
                        log.error(&format!("accept failed: {}", e));
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("listener shutting down");
                break;
            }
        }
    }
}

/// Sniff the first byte and run the matching inbound handshake, then hand
/// the connection to the tunnel engine.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dialer: &WsDialer,
    log: &LogHandle,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut stream: Stream = Box::new(stream);

    let mut first = [0u8; 1];
    tokio::time::timeout(SNIFF_TIMEOUT, stream.read_exact(&mut first))
        .await
        .map_err(|_| Error::Timeout)??;

    let handshake = match protocol::sniff(first[0]) {
        Some(ProtocolFamily::Socks5) => protocol::socks5_handshake(stream).await?,
        Some(ProtocolFamily::Http) => {
            match protocol::http_handshake(stream, first[0]).await? {
                Some(handshake) => handshake,
                // Request already answered locally (405/400); just drop.
                None => return Ok(()),
            }
        }
        None => {
            log.error(&format!(
                "unknown protocol byte {:#04x} from {}",
                first[0], addr
            ));
            return Ok(());
        }
    };

    log.info(&format!(
        "{}: {} -> {}",
        handshake.mode.as_str(),
        addr,
        handshake.target
    ));

    tunnel::run(dialer, log, &addr.to_string(), handshake).await
}
