//! Server configuration.
//!
//! [`ServerConfig`] is what the server runs with. [`ServerSettings`] is its
//! serializable form, for applications that keep the server section in a
//! TOML file:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8077
//! read_timeout = 30
//! max_connections = 64
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 8077;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, anything `tokio::net::TcpListener::bind` accepts.
    pub bind_addr: String,

    /// Per-read timeout on accepted connections. `None` waits forever.
    pub read_timeout: Option<Duration>,

    /// Maximum concurrent connections. `None` accepts without limit.
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            read_timeout: None,
            max_connections: None,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given bind address.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Default::default()
        }
    }

    /// Builder: set read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

/// Serializable server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host or IP to bind.
    pub host: String,

    /// TCP port to bind; 0 picks a free port.
    pub port: u16,

    /// Read timeout in seconds; 0 disables it.
    pub read_timeout: u64,

    /// Connection limit; 0 disables it.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_timeout: 0,
            max_connections: 0,
        }
    }
}

impl ServerSettings {
    /// Parses settings from a TOML document.
    pub fn from_toml_str(content: &str) -> ServerResult<Self> {
        toml::from_str(content)
            .map_err(|e| ServerError::config(format!("failed to parse settings: {e}")))
    }

    /// Loads settings from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Converts these settings into a runtime configuration.
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            read_timeout: (self.read_timeout > 0).then(|| Duration::from_secs(self.read_timeout)),
            max_connections: (self.max_connections > 0).then_some(self.max_connections),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8077");
        assert!(config.read_timeout.is_none());
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::new("0.0.0.0:9000")
            .with_read_timeout(Duration::from_secs(60))
            .with_max_connections(50);

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.read_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_connections, Some(50));
    }

    #[test]
    fn settings_defaults_match_config_defaults() {
        let config = ServerSettings::default().into_config();
        assert_eq!(config.bind_addr, ServerConfig::default().bind_addr);
        assert!(config.read_timeout.is_none());
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn settings_from_partial_toml() {
        let settings = ServerSettings::from_toml_str("port = 9100\nread_timeout = 5\n").unwrap();
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.port, 9100);

        let config = settings.into_config();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.read_timeout, Some(Duration::from_secs(5)));
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn settings_rejects_bad_toml() {
        let result = ServerSettings::from_toml_str("port = \"not a number\"");
        assert!(matches!(result, Err(ServerError::Config { .. })));
    }

    #[test]
    fn settings_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "host = \"0.0.0.0\"\nmax_connections = 8\n").unwrap();

        let config = ServerSettings::load_from(&path).unwrap().into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8077");
        assert_eq!(config.max_connections, Some(8));
    }

    #[test]
    fn settings_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = ServerSettings::load_from(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ServerError::Config { .. })));
    }
}
