//! Configuration structs
//!
//! Client and server settings, loadable from environment variables (a `.env`
//! file is honoured) or deserialized from any serde format.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Client controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Frame raw payloads as binary by default
    #[serde(default)]
    pub binary: bool,
    /// Verify the server certificate on `wss://`
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    /// Fail the session after this long without inbound traffic; 0 disables
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Keep-alive ping period; 0 disables
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// Server controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Frame raw payloads as binary by default
    #[serde(default)]
    pub binary: bool,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

/// Timeouts applied by a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound for sending our close frame and, separately, for waiting
    /// on the peer's reply
    pub close_timeout: Duration,
    /// Longest silence tolerated from the peer once open
    pub idle_timeout: Option<Duration>,
    /// How often an open session pings its peer
    pub ping_interval: Option<Duration>,
}

impl SessionConfig {
    /// How long a controller waits for a closing session's worker before
    /// forcing it to stop
    pub fn shutdown_grace(&self) -> Duration {
        self.close_timeout * 2 + Duration::from_secs(1)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            handshake_timeout: Duration::from_secs(default_handshake_timeout_secs()),
            close_timeout: Duration::from_secs(default_close_timeout_secs()),
            idle_timeout: enabled_secs(default_idle_timeout_secs()),
            ping_interval: enabled_secs(default_ping_interval_secs()),
        }
    }
}

// Default value functions
fn default_verify_peer() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_close_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_ping_interval_secs() -> u64 {
    150
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9001
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            binary: false,
            verify_peer: default_verify_peer(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            binary: false,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            close_timeout_secs: default_close_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from `WS_*` environment variables
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            binary: env_or("WS_BINARY", defaults.binary)?,
            verify_peer: env_or("WS_VERIFY_PEER", defaults.verify_peer)?,
            connect_timeout_secs: env_or("WS_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs)?,
            handshake_timeout_secs: env_or(
                "WS_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout_secs,
            )?,
            close_timeout_secs: env_or("WS_CLOSE_TIMEOUT_SECS", defaults.close_timeout_secs)?,
            idle_timeout_secs: env_or("WS_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            ping_interval_secs: env_or("WS_PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
        })
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            idle_timeout: enabled_secs(self.idle_timeout_secs),
            ping_interval: enabled_secs(self.ping_interval_secs),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `WS_*` environment variables
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            host: env::var("WS_HOST").unwrap_or(defaults.host),
            port: env_or("WS_PORT", defaults.port)?,
            binary: env_or("WS_BINARY", defaults.binary)?,
            handshake_timeout_secs: env_or(
                "WS_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout_secs,
            )?,
            close_timeout_secs: env_or("WS_CLOSE_TIMEOUT_SECS", defaults.close_timeout_secs)?,
            idle_timeout_secs: env_or("WS_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            ping_interval_secs: env_or("WS_PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
        })
    }

    /// Bind address as `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Accepted sessions skip resolve/connect, so the connect timeout is unused
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            idle_timeout: enabled_secs(self.idle_timeout_secs),
            ping_interval: enabled_secs(self.ping_interval_secs),
            ..SessionConfig::default()
        }
    }
}

/// Zero turns a timer off
fn enabled_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name, raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let client = ClientConfig::default();
        assert!(!client.binary);
        assert!(client.verify_peer);
        assert_eq!(client.session().connect_timeout, Duration::from_secs(30));

        let server = ServerConfig::default();
        assert_eq!(server.address(), "0.0.0.0:9001");
        assert_eq!(server.session().close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_partial() {
        let client: ClientConfig =
            serde_json::from_str(r#"{"binary": true, "verify_peer": false}"#).unwrap();
        assert!(client.binary);
        assert!(!client.verify_peer);
        assert_eq!(client.handshake_timeout_secs, 30);

        let server: ServerConfig = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
        assert_eq!(server.address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value::<u16>("WS_PORT", " 80 ").unwrap(), 80);
        assert!(parse_value::<bool>("WS_BINARY", "true").unwrap());

        let err = parse_value::<u16>("WS_PORT", "eighty").unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for WS_PORT: eighty");
    }

    #[test]
    fn test_keep_alive_settings() {
        let server = ServerConfig::default().session();
        assert_eq!(server.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(server.ping_interval, Some(Duration::from_secs(150)));

        let client: ClientConfig =
            serde_json::from_str(r#"{"idle_timeout_secs": 0, "ping_interval_secs": 10}"#).unwrap();
        let session = client.session();
        assert_eq!(session.idle_timeout, None);
        assert_eq!(session.ping_interval, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_shutdown_grace_covers_close() {
        let config = SessionConfig::default();
        assert!(config.shutdown_grace() > config.close_timeout * 2);
    }
}
