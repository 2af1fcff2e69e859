//! TCP acceptor feeding the session registry
//!
//! Each accepted socket becomes a `Session` in `Connecting`, is registered
//! before its task starts, and removes itself from the registry when it
//! closes.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::error::{ServerError, SessionError};
use crate::listener::ServerListener;
use crate::message::Message;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionObserver};
use crate::transport::AcceptedTransport;
use crate::types::SessionId;

const BACKLOG: u32 = 1024;

/// Pause after a failed accept, which is usually descriptor exhaustion
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Acceptor {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    events: Arc<dyn ServerListener>,
    config: SessionConfig,
    cancel: watch::Sender<bool>,
    open: AtomicBool,
}

impl Acceptor {
    /// Bind a listening socket with address reuse enabled
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        events: Arc<dyn ServerListener>,
        config: SessionConfig,
    ) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(BACKLOG).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!("Listening on {}", local_addr);

        let (cancel, _) = watch::channel(false);
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            registry: Arc::new(SessionRegistry::new(Arc::clone(&events))),
            events,
            config,
            cancel,
            open: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_listening(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Accept connections until `cancel` is called
    ///
    /// Accept failures are logged and the loop keeps going after a short
    /// pause, so a persistent error cannot spin the worker. Only the first call
    /// does anything; the listening socket is closed when this returns.
    pub async fn run(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let listener = &listener;
        self.accept_until_cancelled(move || listener.accept()).await;

        self.open.store(false, Ordering::SeqCst);
        info!("Stopped accepting on {}", self.local_addr);
    }

    async fn accept_until_cancelled<A, F>(&self, mut accept: A)
    where
        A: FnMut() -> F,
        F: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        let mut cancel_rx = self.cancel.subscribe();

        loop {
            tokio::select! {
                _ = cancelled(&mut cancel_rx) => break,
                accepted = accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        if !self.is_listening() {
                            break;
                        }
                        error!("Failed to accept connection: {}", e);
                        tokio::select! {
                            _ = cancelled(&mut cancel_rx) => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let observer = Arc::new(AcceptedObserver {
            registry: Arc::clone(&self.registry),
            events: Arc::clone(&self.events),
        });
        let (session, task) = Session::new(observer, self.config);
        debug!(session_id = %session.id(), %peer, "Accepted connection");

        self.registry.add(session);
        tokio::spawn(task.run(AcceptedTransport::new(stream, peer)));
    }

    /// Stop accepting and close every registered session
    ///
    /// Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Close sessions first so the accept loop never exits into an open registry
        self.registry.close_all();
        self.cancel.send_replace(true);
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("local_addr", &self.local_addr)
            .field("listening", &self.is_listening())
            .field("registry", &self.registry)
            .finish()
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
}

/// Routes one accepted session's events to the registry and the listener
struct AcceptedObserver {
    registry: Arc<SessionRegistry>,
    events: Arc<dyn ServerListener>,
}

impl SessionObserver for AcceptedObserver {
    fn on_open(&self, id: SessionId) {
        self.registry.connected(id);
    }

    fn on_message(&self, id: SessionId, message: Message) {
        match message {
            Message::Text(text) => self.events.received_text(&text, id),
            Message::Binary(data) => self.events.received_binary(&data, id),
        }
    }

    fn on_error(&self, id: SessionId, error: &SessionError) {
        debug!(session_id = %id, kind = %error.kind(), "Accepted session failed");
    }

    fn on_closed(&self, id: SessionId, _code: u16) {
        self.registry.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as Frame;

    #[derive(Debug, PartialEq)]
    enum Event {
        Connected,
        Text(String),
        Disconnected,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ServerListener for Recorder {
        fn client_connected(&self, _id: SessionId) {
            let _ = self.0.send(Event::Connected);
        }
        fn client_disconnected(&self, _id: SessionId) {
            let _ = self.0.send(Event::Disconnected);
        }
        fn received_text(&self, text: &str, _id: SessionId) {
            let _ = self.0.send(Event::Text(text.to_string()));
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            close_timeout: Duration::from_millis(500),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_accept_receive_and_cancel() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let acceptor = Arc::new(
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Recorder(tx)), config()).unwrap(),
        );
        let addr = acceptor.local_addr();
        let running = {
            let acceptor = Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.run().await })
        };

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(Event::Connected));
        assert_eq!(acceptor.registry().connected_count(), 1);

        ws.send(Frame::Text("hello".into())).await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Text("hello".to_string())));

        acceptor.cancel();
        running.await.unwrap();
        assert!(!acceptor.is_listening());

        // Our close frame arrives; answering it completes the session
        while let Some(Ok(_)) = ws.next().await {}
        assert_eq!(events.recv().await, Some(Event::Disconnected));

        tokio::time::timeout(Duration::from_secs(5), acceptor.registry().drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_after_cancel_returns() {
        let (tx, _events) = mpsc::unbounded_channel();
        let acceptor =
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Recorder(tx)), config()).unwrap();
        acceptor.cancel();
        tokio::time::timeout(Duration::from_secs(1), acceptor.run())
            .await
            .unwrap();
        assert!(!acceptor.is_listening());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_errors_back_off() {
        let (tx, _events) = mpsc::unbounded_channel();
        let acceptor = Arc::new(
            Acceptor::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Recorder(tx)), config()).unwrap(),
        );
        let attempts = Arc::new(AtomicUsize::new(0));

        let failing = {
            let acceptor = Arc::clone(&acceptor);
            let attempts = Arc::clone(&attempts);
            tokio::spawn(async move {
                acceptor
                    .accept_until_cancelled(|| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        std::future::ready(Err(io::Error::other("too many open files")))
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(350)).await;
        acceptor.cancel();
        tokio::time::timeout(Duration::from_secs(1), failing)
            .await
            .unwrap()
            .unwrap();

        // One attempt per backoff period, not a busy loop
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((1..=5).contains(&attempts), "{attempts} accept attempts");
    }
}
