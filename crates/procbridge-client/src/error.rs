//! Client error types.

use procbridge_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection to server failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// IO error on an established connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error or a response that does not answer our request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server answered with an ErrorResponse.
    #[error("{message}")]
    Application { message: String },

    /// The server answered with a BadResponse.
    #[error("bad response: {message}")]
    BadResponse { message: String },

    /// The call did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl ClientError {
    /// Message sent by the server, for ErrorResponse and BadResponse.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Application { message } | Self::BadResponse { message } => Some(message),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            ProtocolError::Timeout { operation } => Self::Timeout(operation),
            ProtocolError::ConnectionClosed => {
                Self::Protocol("connection closed before a response arrived".to_string())
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}
