//! Basic type definitions for the session layer
//!
//! Provides newtype wrappers and lifecycle enums:
//! - `SessionId`: UUID-based opaque session identity
//! - `SessionState`: per-connection lifecycle
//! - `ClientState`: client controller lifecycle

use uuid::Uuid;

/// Opaque session identity (newtype pattern)
///
/// Wraps a UUID v4, so an identity is never handed out twice even after the
/// session it named is gone. Applications only compare it; it is the key for
/// addressed sends and broadcast exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resolving and opening the byte stream
    Connecting,
    /// Byte stream is up, protocol upgrade in progress
    Handshaking,
    /// Messages flow in both directions
    Open,
    /// Close requested locally or by the peer
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether the session can still accept outbound messages
    pub fn accepts_sends(self) -> bool {
        matches!(self, Self::Connecting | Self::Handshaking | Self::Open)
    }
}

/// Lifecycle of the client controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl From<SessionState> for ClientState {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting | SessionState::Handshaking => Self::Connecting,
            SessionState::Open => Self::Connected,
            SessionState::Closing => Self::Disconnecting,
            SessionState::Closed => Self::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_accepts_sends() {
        assert!(SessionState::Connecting.accepts_sends());
        assert!(SessionState::Open.accepts_sends());
        assert!(!SessionState::Closing.accepts_sends());
        assert!(!SessionState::Closed.accepts_sends());
    }

    #[test]
    fn test_client_state_from_session_state() {
        assert_eq!(ClientState::from(SessionState::Handshaking), ClientState::Connecting);
        assert_eq!(ClientState::from(SessionState::Open), ClientState::Connected);
        assert_eq!(ClientState::from(SessionState::Closing), ClientState::Disconnecting);
        assert_eq!(ClientState::from(SessionState::Closed), ClientState::Idle);
    }
}
