//! Error types for the devoured supervisor
//!
//! Library code returns the typed [`Error`]; the binary wraps it in
//! `anyhow` for context. Would-block conditions never surface here, since
//! the stream layer treats them as "retry on next readiness".

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Critical I/O failure on a descriptor or during setup
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Raw OS error from a syscall wrapper
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// A message violated a wire-format bound (encode or decode)
    #[error("framing error: {0}")]
    Framing(&'static str),

    /// The readiness primitive failed; fatal to the daemon
    #[error("event loop is broken")]
    ReactorBroken,

    /// Pipe or fork failure before a child existed
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    /// Unreadable or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer closed the connection before a response arrived
    #[error("connection closed")]
    Closed,

    /// A client-side request deadline expired
    #[error("timed out waiting for a response")]
    Timeout,
}
