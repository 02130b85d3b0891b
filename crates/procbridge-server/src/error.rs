//! Server error types.

use std::io;
use thiserror::Error;

use crate::registry::RegistryError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (bind, accept, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, transport, payload shape).
    #[error("Protocol error: {0}")]
    Protocol(#[from] procbridge_protocol::ProtocolError),

    /// Handler registration failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
