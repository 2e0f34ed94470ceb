//! Session Layer
//!
//! Responsibilities:
//! - TLS 1.3 + ECH handshake with the gateway
//! - WebSocket client handshake and framing
//!
//! This layer turns a raw TCP dial into an authenticated gateway session.
//! It does NOT parse proxy protocols or move tunnel payload.

mod tls;
mod websocket;

pub use tls::EchDialer;
pub use websocket::{WsDialer, WsStream};
