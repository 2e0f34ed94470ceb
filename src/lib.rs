//! Echlink - a local multi-protocol proxy bridge
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! Local client (SOCKS5 / HTTP proxy)
//! → Listener + protocol sniffer
//! → Protocol FSM (target + first frame)
//! → Tunnel engine
//! → WebSocket session over TLS 1.3 + ECH
//! → Remote gateway
//! ```
//!
//! ## Core Principles
//!
//! - One listener speaks both SOCKS5 and HTTP, dispatched on the first byte
//! - The outbound leg is always WSS with Encrypted Client Hello; a rejected
//!   ECH never falls back to cleartext SNI
//! - ECH configuration is bootstrapped from DNS HTTPS records (UDP or DoH)
//!   and shared across tunnels through a reader/writer store
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, LogSink
//! ├── dns/             # HTTPS-RR query: wire building, UDP + DoH, parsing
//! ├── ech.rs           # Shared ECH config-list store
//! ├── session/         # Outbound session: TLS/ECH dialer, WebSocket client
//! ├── protocol/        # Inbound protocols: sniffer, SOCKS5, HTTP
//! └── app/             # Application: client lifecycle, tunnel engine
//! ```

// Core types
pub mod common;
pub mod error;

// Bootstrap
pub mod dns;
pub mod ech;

// Layered architecture
pub mod session;
pub mod protocol;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use app::ProxyClient;
pub use common::{LogLevel, LogSink, Stream};
pub use config::ClientConfig;
pub use ech::EchStore;
pub use error::{Error, Result};

/// Crate version, surfaced to embedders.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
