//! Application-facing listener contracts
//!
//! The only interfaces the session layer calls into. Every method has a no-op
//! default, so an application implements just the events it cares about.
//! Calls are made on the owning controller's worker thread.

use crate::error::ErrorKind;
use crate::types::SessionId;

/// Events of a client connection
pub trait ClientListener: Send + Sync + 'static {
    /// Handshake succeeded, the session is usable
    fn connected(&self) {}

    /// Session fully closed; carries the peer's close code, 0 when none was given
    fn disconnected(&self, _code: u16) {}

    /// Transport or protocol failure; always followed by `disconnected`
    fn error(&self, _kind: ErrorKind, _message: &str) {}

    /// One text message arrived
    fn received_text(&self, _text: &str) {}

    /// One binary message arrived
    fn received_binary(&self, _data: &[u8]) {}
}

/// Events of a listening server, keyed by the peer's session identity
pub trait ServerListener: Send + Sync + 'static {
    /// Acceptor is bound and accepting
    fn listening(&self) {}

    /// Acceptor and every session are gone; the worker is stopping
    fn closed(&self) {}

    /// A peer completed the handshake
    fn client_connected(&self, _id: SessionId) {}

    /// A previously connected peer is gone
    fn client_disconnected(&self, _id: SessionId) {}

    fn received_text(&self, _text: &str, _id: SessionId) {}

    fn received_binary(&self, _data: &[u8], _id: SessionId) {}
}
