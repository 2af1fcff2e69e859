//! Server-side session registry
//!
//! The registry is the single owner of every accepted `Session`. Everything
//! else (listener callbacks, the application) refers to sessions by
//! `SessionId` and goes through the registry to reach them.
//!
//! All membership changes and broadcasts take one short-held lock. Listener
//! notifications are never made while it is held, so a callback may call
//! straight back into the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::listener::ServerListener;
use crate::message::Message;
use crate::session::Session;
use crate::types::SessionId;

struct Entry {
    session: Session,
    /// `client_connected` was delivered for this session
    announced: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Entry>,
    /// Set by `close_all`; new sessions are closed on arrival
    closing: bool,
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    listener: Arc<dyn ServerListener>,
    drained: Notify,
}

impl SessionRegistry {
    pub fn new(listener: Arc<dyn ServerListener>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            listener,
            drained: Notify::new(),
        }
    }

    /// Register a freshly accepted session
    pub fn add(&self, session: Session) {
        let id = session.id();
        let mut inner = self.inner.lock();
        if inner.closing {
            debug!(session_id = %id, "Registry closing, closing new session");
            session.close();
        }
        inner.sessions.insert(
            id,
            Entry {
                session,
                announced: false,
            },
        );
        debug!(session_id = %id, total = inner.sessions.len(), "Session registered");
    }

    /// Record a completed handshake and notify the listener
    ///
    /// Returns `false` if the session is no longer registered.
    pub fn connected(&self, id: SessionId) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.sessions.get_mut(&id) else {
                return false;
            };
            entry.announced = true;
        }

        info!(session_id = %id, "Client connected");
        self.listener.client_connected(id);
        true
    }

    /// Drop a session from the registry
    ///
    /// A no-op for unknown identities, so a duplicate close notification never
    /// reaches the listener twice. `client_disconnected` is only delivered for
    /// sessions that were announced as connected.
    pub fn remove(&self, id: SessionId) -> bool {
        let (entry, drained) = {
            let mut inner = self.inner.lock();
            let entry = inner.sessions.remove(&id);
            let drained = inner.closing && inner.sessions.is_empty();
            (entry, drained)
        };

        let Some(entry) = entry else {
            return false;
        };

        debug!(session_id = %id, "Session unregistered");
        if entry.announced {
            info!(session_id = %id, "Client disconnected");
            self.listener.client_disconnected(id);
        }
        if drained {
            self.drained.notify_waiters();
        }
        true
    }

    /// Queue `message` on every registered session except `exclude`
    ///
    /// Membership is fixed for the duration of the call. Returns how many
    /// sessions accepted the message.
    pub fn broadcast(&self, message: &Message, exclude: Option<SessionId>) -> usize {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter(|(_, entry)| entry.session.send(message.clone()))
            .count()
    }

    /// Queue `message` on one session; `false` if it is unknown or closing
    pub fn send_to(&self, message: Message, id: SessionId) -> bool {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&id)
            .is_some_and(|entry| entry.session.send(message))
    }

    /// Ask every session to close and refuse to keep new ones open
    pub fn close_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            for entry in inner.sessions.values() {
                entry.session.close();
            }
            debug!(total = inner.sessions.len(), "Closing all sessions");
            inner.sessions.is_empty()
        };

        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once `close_all` was called and the last session is gone
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.closing && inner.sessions.is_empty()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock().closing
    }

    /// Registered sessions, whether or not their handshake finished
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions that completed the handshake and were announced
    pub fn connected_count(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|entry| entry.announced)
            .count()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.lock().sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.lock().sessions.keys().copied().collect()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionRegistry")
            .field("sessions", &inner.sessions.len())
            .field("closing", &inner.closing)
            .finish()
    }
}
