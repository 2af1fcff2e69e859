//! Server controller
//!
//! `WsServer` owns one acceptor and the worker thread it runs on. All accepted
//! sessions live on that worker; the application reaches them through
//! `send_to` / `send_to_all` with a `SessionId`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::ServerListener;
use crate::message::Message;
use crate::registry::SessionRegistry;
use crate::types::SessionId;
use crate::worker::Worker;

const ANY_ADDRESS: &str = "0.0.0.0";

struct Running {
    acceptor: Arc<Acceptor>,
    worker: Worker,
}

/// WebSocket server with addressed and broadcast delivery
pub struct WsServer {
    running: Mutex<Option<Running>>,
    listener: Arc<dyn ServerListener>,
    config: ServerConfig,
}

impl WsServer {
    pub fn new(listener: Arc<dyn ServerListener>, config: ServerConfig) -> Self {
        Self {
            running: Mutex::new(None),
            listener,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Listen on the configured host and port
    ///
    /// # Errors
    /// Same as [`WsServer::listen`]
    pub fn start(&self) -> Result<SocketAddr, ServerError> {
        self.listen(self.config.port, &self.config.host)
    }

    /// Bind `address:port` and start accepting on a new worker thread
    ///
    /// An empty address binds every interface; port 0 picks a free port. A
    /// server that is already listening is closed first. Returns the bound
    /// address once the socket is listening.
    ///
    /// # Errors
    /// Returns an error if the address does not resolve, the bind fails or the
    /// worker thread cannot be started
    pub fn listen(&self, port: u16, address: &str) -> Result<SocketAddr, ServerError> {
        let addr = resolve(address, port)?;
        self.close();

        let events = Arc::clone(&self.listener);
        let session_config = self.config.session();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let worker = Worker::spawn("ws-server", move || async move {
            let acceptor = match Acceptor::bind(addr, Arc::clone(&events), session_config) {
                Ok(acceptor) => Arc::new(acceptor),
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(Arc::clone(&acceptor)));

            let _closed = ClosedNotice(Arc::clone(&events));
            events.listening();

            acceptor.run().await;
            acceptor.registry().drained().await;
            info!("Server worker finished");
        })
        .map_err(ServerError::Worker)?;

        let acceptor = match ready_rx.recv() {
            Ok(Ok(acceptor)) => acceptor,
            Ok(Err(e)) => {
                error!("Failed to start server: {}", e);
                worker.shutdown(Duration::ZERO);
                return Err(e);
            }
            Err(_) => {
                worker.shutdown(Duration::ZERO);
                return Err(ServerError::WorkerExited);
            }
        };

        let local_addr = acceptor.local_addr();
        let displaced = self.running.lock().replace(Running { acceptor, worker });
        if let Some(displaced) = displaced {
            self.stop(displaced);
        }
        Ok(local_addr)
    }

    /// Stop accepting, close every session and wait for the worker to stop
    ///
    /// Idempotent.
    pub fn close(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            self.stop(running);
        }
    }

    fn stop(&self, running: Running) {
        info!("Closing server on {}", running.acceptor.local_addr());
        running.acceptor.cancel();
        running
            .worker
            .shutdown(self.config.session().shutdown_grace());
    }

    /// Queue `message` on every session except `exclude`
    ///
    /// Returns how many sessions took the message.
    pub fn send_to_all(&self, message: impl Into<Message>, exclude: Option<SessionId>) -> usize {
        self.registry()
            .map_or(0, |registry| registry.broadcast(&message.into(), exclude))
    }

    /// Queue `message` on one session; `false` if the id is unknown
    pub fn send_to(&self, message: impl Into<Message>, id: SessionId) -> bool {
        self.registry()
            .is_some_and(|registry| registry.send_to(message.into(), id))
    }

    /// Broadcast a raw payload framed according to the configured default mode
    pub fn send_payload_to_all(&self, payload: impl Into<Vec<u8>>, exclude: Option<SessionId>) -> usize {
        self.send_to_all(Message::from_payload(payload.into(), self.config.binary), exclude)
    }

    /// Send a raw payload framed according to the configured default mode
    pub fn send_payload_to(&self, payload: impl Into<Vec<u8>>, id: SessionId) -> bool {
        self.send_to(Message::from_payload(payload.into(), self.config.binary), id)
    }

    /// Connected clients (handshake completed)
    pub fn client_count(&self) -> usize {
        self.registry()
            .map_or(0, |registry| registry.connected_count())
    }

    pub fn client_ids(&self) -> Vec<SessionId> {
        self.registry()
            .map_or_else(Vec::new, |registry| registry.ids())
    }

    pub fn is_listening(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| running.acceptor.is_listening())
    }

    /// True while the worker thread is alive
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.worker.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.acceptor.local_addr())
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Bound IP address as text
    pub fn address(&self) -> Option<String> {
        self.local_addr().map(|addr| addr.ip().to_string())
    }

    fn registry(&self) -> Option<Arc<SessionRegistry>> {
        self.running
            .lock()
            .as_ref()
            .map(|running| Arc::clone(running.acceptor.registry()))
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("local_addr", &self.local_addr())
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Fires `closed` when the server worker's task ends, however it ends
struct ClosedNotice(Arc<dyn ServerListener>);

impl Drop for ClosedNotice {
    fn drop(&mut self) {
        info!("Server closed");
        self.0.closed();
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let host = if address.is_empty() { ANY_ADDRESS } else { address };
    let invalid = || ServerError::InvalidAddress(format!("{host}:{port}"));

    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        listening: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ServerListener for Counter {
        fn listening(&self) {
            self.listening.fetch_add(1, Ordering::SeqCst);
        }
        fn closed(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server() -> (Arc<Counter>, WsServer) {
        let counter = Arc::new(Counter::default());
        let server = WsServer::new(
            Arc::clone(&counter) as Arc<dyn ServerListener>,
            ServerConfig::default(),
        );
        (counter, server)
    }

    #[test]
    fn test_resolve_empty_address_binds_any() {
        let addr = resolve("", 9001).unwrap();
        assert_eq!(addr, "0.0.0.0:9001".parse().unwrap());

        let addr = resolve("::1", 80).unwrap();
        assert!(addr.is_ipv6());

        assert!(matches!(
            resolve("not an address", 80),
            Err(ServerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_listen_and_close() {
        let (counter, server) = server();
        let addr = server.listen(0, "127.0.0.1").unwrap();

        assert_ne!(addr.port(), 0);
        assert_eq!(server.port(), Some(addr.port()));
        assert_eq!(server.address().as_deref(), Some("127.0.0.1"));
        assert!(server.is_listening());
        assert!(server.is_running());
        assert_eq!(server.client_count(), 0);

        server.close();
        server.close();
        assert!(!server.is_running());
        assert!(!server.is_listening());
        assert_eq!(server.local_addr(), None);
        assert_eq!(counter.listening.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listen_twice_replaces_acceptor() {
        let (counter, server) = server();
        server.listen(0, "127.0.0.1").unwrap();
        let second = server.listen(0, "127.0.0.1").unwrap();

        assert_eq!(server.local_addr(), Some(second));
        assert!(server.is_listening());
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);

        drop(server);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let (_counter, server) = server();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        assert!(matches!(
            server.listen(port, "127.0.0.1"),
            Err(ServerError::Bind { .. })
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn test_send_without_listening() {
        let (_counter, server) = server();
        assert_eq!(server.send_to_all("hi", None), 0);
        assert!(!server.send_to("hi", SessionId::new()));
        assert!(server.client_ids().is_empty());
    }
}
