//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - PrependStream: stream with pre-buffered bytes replayed first
//! - LogSink: pluggable log capability for embedders

mod sink;
mod stream;

pub use sink::{LogHandle, LogLevel, LogSink};
pub use stream::{IntoStream, PrependStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
