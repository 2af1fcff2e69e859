//! Error types for the session layer
//!
//! Session failures are terminal for the affected session and are reported
//! once through the listener; controller errors are returned to the caller.
//! Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failure category reported to listeners
///
/// A peer-initiated close is not an error and has no kind; it shows up as the
/// close code passed to `disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host name could not be resolved
    Resolution,
    /// TCP connection could not be established
    Connect,
    /// TLS or WebSocket upgrade failed
    Handshake,
    /// Reading from an open session failed
    TransportRead,
    /// Writing to an open session failed
    TransportWrite,
}

impl ErrorKind {
    /// Stable numeric code handed to listeners alongside the message
    pub fn code(self) -> i32 {
        match self {
            Self::Resolution => 1,
            Self::Connect => 2,
            Self::Handshake => 3,
            Self::TransportRead => 4,
            Self::TransportWrite => 5,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resolution => "resolution failure",
            Self::Connect => "connect failure",
            Self::Handshake => "handshake failure",
            Self::TransportRead => "transport read failure",
            Self::TransportWrite => "transport write failure",
        };
        f.write_str(name)
    }
}

/// Session-level failure (always terminal for the session)
#[derive(Debug, Error)]
pub enum SessionError {
    /// DNS lookup failed
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// DNS lookup returned nothing
    #[error("no addresses found for {0}")]
    NoAddress(String),

    /// Every resolved address refused or failed
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// TLS client configuration could not be built
    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),

    /// TLS negotiation or WebSocket upgrade failed
    #[error("handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Reading a frame failed
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),

    /// Writing a frame failed
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),

    /// Peer sent nothing, not even a pong, for the configured idle timeout
    #[error("no traffic from peer for {0:?}")]
    IdleTimeout(Duration),
}

impl SessionError {
    /// Failure category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolve { .. } | Self::NoAddress(_) => ErrorKind::Resolution,
            Self::Connect(_) | Self::ConnectTimeout(_) => ErrorKind::Connect,
            Self::Tls(_) | Self::Handshake(_) | Self::HandshakeTimeout(_) => ErrorKind::Handshake,
            Self::Read(_) | Self::IdleTimeout(_) => ErrorKind::TransportRead,
            Self::Write(_) => ErrorKind::TransportWrite,
        }
    }
}

/// Endpoint URL errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid URL: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported scheme '{0}', expected ws or wss")]
    Scheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Client controller errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL passed to `connect` is unusable
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// `reconnect` called before any successful `connect`
    #[error("no endpoint to reconnect to")]
    NoEndpoint,

    /// Background worker could not be started
    #[error("failed to start client worker: {0}")]
    Worker(#[source] std::io::Error),
}

/// Server controller errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Background worker could not be started
    #[error("failed to start server worker: {0}")]
    Worker(#[source] std::io::Error),

    /// Worker ended before reporting the bind result
    #[error("server worker exited before binding")]
    WorkerExited,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_kinds() {
        let err = SessionError::NoAddress("example.invalid".to_string());
        assert_eq!(err.kind(), ErrorKind::Resolution);

        let err = SessionError::HandshakeTimeout(Duration::from_secs(1));
        assert_eq!(err.kind(), ErrorKind::Handshake);

        let err = SessionError::Read(tungstenite::Error::ConnectionClosed);
        assert_eq!(err.kind(), ErrorKind::TransportRead);

        let err = SessionError::IdleTimeout(Duration::from_secs(300));
        assert_eq!(err.kind(), ErrorKind::TransportRead);

        let err = SessionError::Write(tungstenite::Error::AlreadyClosed);
        assert_eq!(err.kind(), ErrorKind::TransportWrite);
    }

    #[test]
    fn test_error_codes_distinct() {
        let kinds = [
            ErrorKind::Resolution,
            ErrorKind::Connect,
            ErrorKind::Handshake,
            ErrorKind::TransportRead,
            ErrorKind::TransportWrite,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::Connect(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(err.to_string(), "connect failed: refused");
        assert_eq!(ErrorKind::Handshake.to_string(), "handshake failure");
    }
}
