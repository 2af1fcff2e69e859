//! Client controller
//!
//! `WsClient` owns at most one active session to one endpoint, together with
//! the worker thread that drives it. Connecting again (or reconnecting)
//! always tears the previous session down first, so there is never more than
//! one send target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, SessionError};
use crate::listener::ClientListener;
use crate::message::Message;
use crate::session::{Session, SessionObserver};
use crate::transport::ClientTransport;
use crate::types::{ClientState, SessionId};
use crate::worker::Worker;

/// Session handle plus the worker running it
struct Active {
    session: Session,
    worker: Worker,
    observer: Arc<ClientObserver>,
}

#[derive(Default)]
struct ClientInner {
    /// Last endpoint passed to `connect`, kept for `reconnect`
    endpoint: Option<Endpoint>,
    active: Option<Active>,
    /// Worker thread some caller is currently shutting down
    stopping: Option<ThreadId>,
}

/// WebSocket client with explicit connect / reconnect / disconnect
pub struct WsClient {
    inner: Mutex<ClientInner>,
    /// Signalled each time a shutdown in progress completes
    stopped: Condvar,
    listener: Arc<dyn ClientListener>,
    config: ClientConfig,
}

impl WsClient {
    pub fn new(listener: Arc<dyn ClientListener>, config: ClientConfig) -> Self {
        Self {
            inner: Mutex::new(ClientInner::default()),
            stopped: Condvar::new(),
            listener,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to a `ws://` or `wss://` URL
    ///
    /// Any active session is disconnected first (blocking until its worker is
    /// gone). Returns once the new worker is started; the outcome of the
    /// connection itself is reported through the listener.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the worker thread cannot be
    /// started. An invalid URL leaves the current session untouched.
    pub fn connect(&self, url: &str) -> Result<(), ClientError> {
        let endpoint = Endpoint::parse(url)?;
        self.disconnect();
        self.start(endpoint)
    }

    /// Connect again to the last endpoint passed to `connect`
    ///
    /// # Errors
    /// Returns `ClientError::NoEndpoint` if `connect` was never called
    pub fn reconnect(&self) -> Result<(), ClientError> {
        let endpoint = self.inner.lock().endpoint.clone();
        let Some(endpoint) = endpoint else {
            warn!("Reconnect requested but no URL was ever set");
            return Err(ClientError::NoEndpoint);
        };

        self.disconnect();
        self.start(endpoint)
    }

    /// Close the active session and wait for its worker to stop
    ///
    /// Idempotent; also reaps the worker of a session that already failed.
    /// A call made while another thread is already disconnecting waits for
    /// that shutdown to complete, so the worker is gone whenever this returns
    /// (except from inside a listener callback, which never waits on itself).
    pub fn disconnect(&self) {
        let active = {
            let mut inner = self.inner.lock();
            if !self.wait_for_stop(&mut inner) {
                return;
            }
            let Some(active) = inner.active.take() else {
                return;
            };
            inner.stopping = active.worker.thread_id();
            active
        };

        info!(session_id = %active.session.id(), "Disconnecting");
        self.retire(active);
    }

    /// Queue a message on the active session
    ///
    /// Returns `false` (and drops the message) when there is no session or it
    /// is closing.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        let inner = self.inner.lock();
        match inner.active.as_ref() {
            Some(active) => active.session.send(message),
            None => {
                debug!("Send without an active session");
                false
            }
        }
    }

    /// Queue a raw payload, framed according to the configured default mode
    pub fn send_payload(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.send(Message::from_payload(payload.into(), self.config.binary))
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| active.session.is_connected())
    }

    pub fn state(&self) -> ClientState {
        let inner = self.inner.lock();
        if inner.stopping.is_some() {
            return ClientState::Disconnecting;
        }
        inner
            .active
            .as_ref()
            .map_or(ClientState::Idle, |active| active.session.state().into())
    }

    /// Last URL passed to `connect`
    pub fn url(&self) -> Option<String> {
        self.inner
            .lock()
            .endpoint
            .as_ref()
            .map(|endpoint| endpoint.as_str().to_string())
    }

    /// Identity of the active session, if any
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().active.as_ref().map(|active| active.session.id())
    }

    /// True while a worker thread is alive
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.stopping.is_some()
            || inner
                .active
                .as_ref()
                .is_some_and(|active| !active.worker.is_finished())
    }

    fn start(&self, endpoint: Endpoint) -> Result<(), ClientError> {
        let observer = Arc::new(ClientObserver::new(Arc::clone(&self.listener)));
        let (session, task) = Session::new(
            Arc::clone(&observer) as Arc<dyn SessionObserver>,
            self.config.session(),
        );
        let transport = ClientTransport::new(endpoint.clone(), self.config.verify_peer);

        info!(url = %endpoint, session_id = %session.id(), "Connecting");
        let worker =
            Worker::spawn("ws-client", move || task.run(transport)).map_err(ClientError::Worker)?;

        let (displaced, tracked) = {
            let mut inner = self.inner.lock();
            // From a callback of the worker being stopped this goes ahead
            let tracked = self.wait_for_stop(&mut inner);
            inner.endpoint = Some(endpoint);
            let displaced = inner.active.replace(Active {
                session,
                worker,
                observer,
            });
            if tracked {
                inner.stopping = displaced.as_ref().and_then(|d| d.worker.thread_id());
            }
            (displaced, tracked)
        };

        // Another connect raced us; only one session may stay active
        match displaced {
            Some(displaced) if tracked => self.retire(displaced),
            Some(displaced) => self.stop(displaced),
            None => {}
        }
        Ok(())
    }

    /// Block while another caller is shutting a worker down
    ///
    /// Returns `false` without waiting when called on the worker being shut
    /// down, which would otherwise wait on itself.
    fn wait_for_stop(&self, inner: &mut MutexGuard<'_, ClientInner>) -> bool {
        let current = thread::current().id();
        while let Some(stopping) = inner.stopping {
            if stopping == current {
                return false;
            }
            self.stopped.wait(inner);
        }
        true
    }

    /// Stop a worker this caller marked as `stopping`, then wake any waiters
    fn retire(&self, active: Active) {
        self.stop(active);
        self.inner.lock().stopping = None;
        self.stopped.notify_all();
    }

    fn stop(&self, active: Active) {
        active.session.close();
        let joined = active
            .worker
            .shutdown(self.config.session().shutdown_grace());

        // A worker stopped mid-close never reached on_closed
        if joined {
            active.observer.closed(0);
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish()
    }
}

/// Adapts session events to the application's `ClientListener`
struct ClientObserver {
    listener: Arc<dyn ClientListener>,
    disconnected: AtomicBool,
}

impl ClientObserver {
    fn new(listener: Arc<dyn ClientListener>) -> Self {
        Self {
            listener,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Deliver `disconnected` at most once
    fn closed(&self, code: u16) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.listener.disconnected(code);
        }
    }
}

impl SessionObserver for ClientObserver {
    fn on_open(&self, _id: SessionId) {
        self.listener.connected();
    }

    fn on_message(&self, _id: SessionId, message: Message) {
        match message {
            Message::Text(text) => self.listener.received_text(&text),
            Message::Binary(data) => self.listener.received_binary(&data),
        }
    }

    fn on_error(&self, _id: SessionId, error: &SessionError) {
        self.listener.error(error.kind(), &error.to_string());
    }

    fn on_closed(&self, _id: SessionId, code: u16) {
        self.closed(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[derive(Debug, PartialEq)]
    enum Event {
        Connected,
        Disconnected(u16),
        Error(ErrorKind),
    }

    struct Recorder(Mutex<mpsc::Sender<Event>>);

    impl ClientListener for Recorder {
        fn connected(&self) {
            let _ = self.0.lock().send(Event::Connected);
        }
        fn disconnected(&self, code: u16) {
            let _ = self.0.lock().send(Event::Disconnected(code));
        }
        fn error(&self, kind: ErrorKind, _message: &str) {
            let _ = self.0.lock().send(Event::Error(kind));
        }
    }

    fn client() -> (WsClient, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let config = ClientConfig {
            close_timeout_secs: 1,
            ..ClientConfig::default()
        };
        (WsClient::new(Arc::new(Recorder(Mutex::new(tx))), config), rx)
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Completes the upgrade, then ignores the socket until released
    fn unresponsive_peer() -> (u16, mpsc::Sender<()>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release, released) = mpsc::channel::<()>();
        let peer = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ws = tokio_tungstenite::tungstenite::accept(stream).unwrap();
            let _ = released.recv();
        });
        (port, release, peer)
    }

    #[test]
    fn test_reconnect_without_url() {
        let (client, events) = client();
        assert!(matches!(client.reconnect(), Err(ClientError::NoEndpoint)));
        assert!(events.try_recv().is_err());
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let (client, _events) = client();
        assert!(matches!(
            client.connect("http://localhost/"),
            Err(ClientError::Endpoint(_))
        ));
        assert!(client.url().is_none());
        assert!(!client.is_running());
    }

    #[test]
    fn test_disconnect_before_connect() {
        let (client, events) = client();
        client.disconnect();
        client.disconnect();
        assert!(!client.is_running());
        assert!(!client.send("nobody listening"));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_failed_connect_then_disconnect() {
        let (client, events) = client();
        let url = format!("ws://127.0.0.1:{}/", unused_port());
        client.connect(&url).unwrap();
        assert_eq!(client.url().as_deref(), Some(url.as_str()));

        let timeout = Duration::from_secs(5);
        assert_eq!(events.recv_timeout(timeout), Ok(Event::Error(ErrorKind::Connect)));
        assert_eq!(events.recv_timeout(timeout), Ok(Event::Disconnected(0)));

        client.disconnect();
        assert!(!client.is_running());
        assert!(!client.is_connected());
        assert_eq!(client.state(), ClientState::Idle);
        // No second disconnected for the same session
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_send_payload_uses_default_mode() {
        let (tx, _rx) = mpsc::channel();
        let config = ClientConfig {
            binary: true,
            ..ClientConfig::default()
        };
        let client = WsClient::new(Arc::new(Recorder(Mutex::new(tx))), config);
        // No session: dropped regardless of framing
        assert!(!client.send_payload(b"abc".to_vec()));
        assert!(client.config().binary);
    }

    #[test]
    fn test_concurrent_disconnect_waits_for_worker() {
        let (port, release, peer) = unresponsive_peer();
        let (client, events) = client();
        let client = Arc::new(client);
        client.connect(&format!("ws://127.0.0.1:{port}/")).unwrap();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(Event::Connected)
        );

        // The peer never answers our close frame, so this blocks for a while
        let first = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.disconnect())
        };
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        client.disconnect();
        let waited = started.elapsed();

        assert!(!client.is_running());
        assert_eq!(client.state(), ClientState::Idle);
        assert!(waited >= Duration::from_millis(500), "returned after {waited:?}");
        assert_eq!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(Event::Disconnected(0))
        );

        first.join().unwrap();
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        release.send(()).unwrap();
        peer.join().unwrap();
    }
}
