//! Log sink capability
//!
//! Embedders (mobile shells, GUIs) install a sink to receive proxy log lines;
//! without one, messages route to the tracing subscriber.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info};

/// Log severity exposed to embedders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Capability for receiving log messages from a running client
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

/// Atomically replaceable holder for an optional LogSink
#[derive(Default)]
pub struct LogHandle {
    sink: RwLock<Option<Arc<dyn LogSink>>>,
}

impl LogHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the sink. Replacement is atomic with respect to
    /// concurrent `info`/`error` calls.
    pub fn set(&self, sink: Arc<dyn LogSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn info(&self, message: &str) {
        match self.sink.read().as_ref() {
            Some(sink) => sink.log(LogLevel::Info, message),
            None => info!("{}", message),
        }
    }

    pub fn error(&self, message: &str) {
        match self.sink.read().as_ref() {
            Some(sink) => sink.log(LogLevel::Error, message),
            None => error!("{}", message),
        }
    }
}
