//! Error types for Echlink

use thiserror::Error;

/// Main error type for Echlink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ECH bootstrap error: {0}")]
    Bootstrap(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("ECH config not loaded")]
    EchNotLoaded,

    #[error("Proxy already running")]
    AlreadyRunning,

    #[error("Proxy not running")]
    NotRunning,

    #[error("Timeout")]
    Timeout,

    #[error("Connection failed, max retries exceeded")]
    MaxRetriesExceeded,
}

impl Error {
    /// Whether this error is a routine connection teardown that should be
    /// kept off the ERROR log channel (EOF, resets, orderly WS closes).
    pub fn is_normal_close(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            Error::Protocol(msg) | Error::Dial(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("use of closed network connection")
                    || msg.contains("broken pipe")
                    || msg.contains("connection reset by peer")
                    || msg.contains("normal closure")
                    || msg.contains("connection closed")
            }
            _ => false,
        }
    }
}

/// Result type alias for Echlink
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_close_classification() {
        let eof = Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_normal_close());

        let reset = Error::Protocol("connection reset by peer".into());
        assert!(reset.is_normal_close());

        let ws_close = Error::Dial("WebSocket protocol error: Normal closure".into());
        assert!(ws_close.is_normal_close());

        assert!(!Error::AlreadyRunning.is_normal_close());
        assert!(!Error::Protocol("unexpected gateway response".into()).is_normal_close());
    }
}
