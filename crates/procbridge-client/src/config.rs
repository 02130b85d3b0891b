//! Client configuration.

use std::time::Duration;

/// Address used when none is configured.
pub const DEFAULT_ADDR: &str = "127.0.0.1:8077";

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server address, anything `tokio::net::TcpStream::connect` accepts.
    pub addr: String,

    /// Upper bound on one whole call (connect, send, receive).
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            timeout: None,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given server address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Builder: bound every call by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
