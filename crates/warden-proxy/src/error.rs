//! Error types for the proxy crate.

use std::net::SocketAddr;

use thiserror::Error;
use warden_storage::StorageError;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The listener could not be bound.
    #[error("Failed to listen on {addr}: {source}")]
    Spawn {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying bind error.
        source: std::io::Error,
    },

    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Errors talking to the elevated shell.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// The shell process could not be started.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying spawn error.
        source: std::io::Error,
    },

    /// Reading from or writing to the shell failed.
    #[error("Shell IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The excluded identity is not a uid or plain user name.
    #[error("Invalid excluded identity: {0:?}")]
    InvalidIdentity(String),

    /// The shell exited before answering.
    #[error("Shell exited while running: {command}")]
    SessionClosed {
        /// Command that was in flight.
        command: String,
    },
}

/// Failure of a transparent-proxy rule batch.
#[derive(Debug, Error)]
#[error("Rule batch aborted after {applied} of {total} rules: {source}")]
pub struct TransparentProxyError {
    /// Rules executed before the failure.
    pub applied: usize,
    /// Rules in the batch.
    pub total: usize,
    /// Shell failure that aborted the batch.
    #[source]
    pub source: PrivilegeError,
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
