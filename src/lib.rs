//! WebSocket Session Layer
//!
//! A message-oriented connection layer built on tokio-tungstenite: discrete
//! text/binary messages over many concurrent peers, with a strict per-session
//! write order.
//!
//! # Features
//! - Per-connection sessions with a single in-flight write
//! - Server-side session registry with addressed and broadcast delivery
//! - Client controller with connect / reconnect / disconnect
//! - Plain (`ws://`) and TLS (`wss://`) client transports
//! - Listener traits as the only application-facing contract
//!
//! # Architecture
//! Each controller (`WsClient`, `WsServer`) owns one worker thread running a
//! single-threaded tokio runtime. Sessions run as tasks on that runtime and
//! report back through `ClientListener` / `ServerListener` on the worker
//! thread. Application calls (`send`, `close`, ...) may come from any thread:
//! they only touch short-held locks and hand work to the session task.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use ws_hub::{ServerConfig, ServerListener, SessionId, WsServer};
//!
//! struct Log;
//!
//! impl ServerListener for Log {
//!     fn received_text(&self, text: &str, id: SessionId) {
//!         println!("{id}: {text}");
//!     }
//! }
//!
//! let server = WsServer::new(Arc::new(Log), ServerConfig::default());
//! server.listen(9001, "")?;
//! server.send_to_all("hello everyone", None);
//! ```

pub mod acceptor;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod message;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use acceptor::Acceptor;
pub use client::WsClient;
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use endpoint::Endpoint;
pub use error::{ClientError, ConfigError, EndpointError, ErrorKind, ServerError, SessionError};
pub use listener::{ClientListener, ServerListener};
pub use message::Message;
pub use queue::{Enqueued, MessageQueue};
pub use registry::SessionRegistry;
pub use server::WsServer;
pub use session::{Session, SessionObserver, SessionTask};
pub use transport::{AcceptedTransport, ClientTransport, Transport};
pub use types::{ClientState, SessionId, SessionState};
pub use worker::Worker;
