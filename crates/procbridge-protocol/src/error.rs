//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds maximum allowed size.
    #[error("payload too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Failed to serialize or parse the JSON payload.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame does not start with the protocol magic.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame carries a version other than the one we speak.
    #[error("incompatible version: {major}.{minor}")]
    IncompatibleVersion { major: u8, minor: u8 },

    /// Status code byte is outside the known range.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u8),

    /// Frame is well formed but its payload does not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the stream before the first byte of a frame.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Stream ended in the middle of a frame.
    #[error("incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// Operation timed out.
    #[error("timeout during {operation}")]
    Timeout { operation: String },
}

impl ProtocolError {
    /// Creates a malformed frame error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame(message.into())
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// Returns true if the peer went away cleanly between frames.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }

    /// Returns true if the error means the byte stream can no longer be
    /// trusted to be aligned on a frame boundary.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_)
                | Self::IncompatibleVersion { .. }
                | Self::InvalidStatusCode(_)
                | Self::MessageTooLarge { .. }
                | Self::IncompleteFrame { .. }
        )
    }
}
