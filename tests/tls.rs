//! wss:// against a local peer holding a self-signed certificate

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use ws_hub::{ClientConfig, ClientListener, ErrorKind, WsClient};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
enum ClientEvent {
    Connected,
    Disconnected(u16),
    Error(ErrorKind),
}

struct ClientRecorder(Mutex<Sender<ClientEvent>>);

impl ClientRecorder {
    fn push(&self, event: ClientEvent) {
        let _ = self.0.lock().unwrap().send(event);
    }
}

impl ClientListener for ClientRecorder {
    fn connected(&self) {
        self.push(ClientEvent::Connected);
    }
    fn disconnected(&self, code: u16) {
        self.push(ClientEvent::Disconnected(code));
    }
    fn error(&self, kind: ErrorKind, _message: &str) {
        self.push(ClientEvent::Error(kind));
    }
}

/// Server config for a fresh self-signed `localhost` certificate
fn self_signed_acceptor() -> TlsAcceptor {
    let params = CertificateParams::new(vec!["localhost".to_string()])
        .expect("valid subject alt name");
    let key_pair = KeyPair::generate().expect("key generation should succeed");
    let cert = params
        .self_signed(&key_pair)
        .expect("self-signing should succeed");

    let cert_chain = vec![CertificateDer::from(cert.der().to_vec())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .expect("ring supports the default protocol versions")
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .expect("certificate and key should match");

    TlsAcceptor::from(Arc::new(config))
}

/// Serves one wss:// connection on its own runtime
///
/// Reports whether the WebSocket upgrade completed, then keeps reading so our
/// close frame gets answered.
fn spawn_tls_peer() -> (SocketAddr, Receiver<bool>, thread::JoinHandle<()>) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let (upgraded_tx, upgraded) = mpsc::channel();

    let peer = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::from_std(std_listener).unwrap();
            let (stream, _) = listener.accept().await.unwrap();

            // A client that rejects the certificate aborts right here
            let Ok(tls) = self_signed_acceptor().accept(stream).await else {
                let _ = upgraded_tx.send(false);
                return;
            };
            match tokio_tungstenite::accept_async(tls).await {
                Ok(mut ws) => {
                    let _ = upgraded_tx.send(true);
                    while let Some(Ok(_)) = ws.next().await {}
                }
                Err(_) => {
                    let _ = upgraded_tx.send(false);
                }
            }
        });
    });

    (addr, upgraded, peer)
}

fn new_client(verify_peer: bool) -> (WsClient, Receiver<ClientEvent>) {
    let (tx, rx) = mpsc::channel();
    let config = ClientConfig {
        verify_peer,
        close_timeout_secs: 1,
        ..ClientConfig::default()
    };
    (WsClient::new(Arc::new(ClientRecorder(Mutex::new(tx))), config), rx)
}

#[test]
fn test_verified_wss_rejects_self_signed_certificate() {
    let (addr, upgraded, peer) = spawn_tls_peer();
    let (client, events) = new_client(true);
    client
        .connect(&format!("wss://localhost:{}/", addr.port()))
        .unwrap();

    assert_eq!(
        events.recv_timeout(WAIT),
        Ok(ClientEvent::Error(ErrorKind::Handshake))
    );
    assert_eq!(events.recv_timeout(WAIT), Ok(ClientEvent::Disconnected(0)));
    assert!(events.recv_timeout(QUIET).is_err());
    assert!(!client.is_connected());

    assert_eq!(upgraded.recv_timeout(WAIT), Ok(false));
    client.disconnect();
    peer.join().unwrap();
}

#[test]
fn test_unverified_wss_accepts_self_signed_certificate() {
    let (addr, upgraded, peer) = spawn_tls_peer();
    let (client, events) = new_client(false);
    client
        .connect(&format!("wss://localhost:{}/secure", addr.port()))
        .unwrap();

    assert_eq!(events.recv_timeout(WAIT), Ok(ClientEvent::Connected));
    assert_eq!(upgraded.recv_timeout(WAIT), Ok(true));
    assert!(client.is_connected());

    client.disconnect();
    assert_eq!(events.recv_timeout(WAIT), Ok(ClientEvent::Disconnected(1000)));
    assert!(!client.is_running());
    peer.join().unwrap();
}
