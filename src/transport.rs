//! Transport capability behind a session
//!
//! A `Session` is generic over how its byte stream is produced and upgraded.
//! The client side resolves, connects and (for `wss://`) negotiates TLS before
//! the WebSocket upgrade; the server side starts from an accepted socket and
//! answers the upgrade.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::SessionError;
use crate::tls;

/// Produces the message stream a session runs on
#[async_trait]
pub trait Transport: Send + 'static {
    /// Raw byte stream after `connect`
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// Byte stream the WebSocket runs on after `handshake`
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish the byte stream (`Connecting` phase)
    async fn connect(&mut self) -> Result<Self::Io, SessionError>;

    /// Upgrade the byte stream to a message stream (`Handshaking` phase)
    async fn handshake(&mut self, io: Self::Io) -> Result<WebSocketStream<Self::Stream>, SessionError>;
}

/// Outbound transport to a `ws://` or `wss://` endpoint
#[derive(Debug, Clone)]
pub struct ClientTransport {
    endpoint: Endpoint,
    verify_peer: bool,
}

impl ClientTransport {
    pub fn new(endpoint: Endpoint, verify_peer: bool) -> Self {
        Self {
            endpoint,
            verify_peer,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for ClientTransport {
    type Io = TcpStream;
    type Stream = MaybeTlsStream<TcpStream>;

    async fn connect(&mut self) -> Result<TcpStream, SessionError> {
        let host = self.endpoint.host();
        let addrs: Vec<SocketAddr> = lookup_host((host, self.endpoint.port()))
            .await
            .map_err(|source| SessionError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(SessionError::NoAddress(host.to_string()));
        }

        // Try each resolved address in turn, keep the last failure
        let mut last_err = None;
        for addr in addrs {
            trace!("Connecting to {}", addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(SessionError::Connect)?;
                    debug!("TCP connection to {} established", addr);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(SessionError::Connect(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no address could be connected")
        })))
    }

    async fn handshake(
        &mut self,
        io: TcpStream,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, SessionError> {
        let request = self
            .endpoint
            .request_uri()
            .into_client_request()
            .map_err(SessionError::Handshake)?;
        let connector = tls::connector(self.endpoint.is_secure(), self.verify_peer)?;

        let (ws_stream, response) =
            tokio_tungstenite::client_async_tls_with_config(request, io, None, Some(connector))
                .await
                .map_err(SessionError::Handshake)?;

        debug!(
            "Handshake with {} completed ({})",
            self.endpoint,
            response.status()
        );
        Ok(ws_stream)
    }
}

/// Server-side transport for an already accepted socket
#[derive(Debug)]
pub struct AcceptedTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl AcceptedTransport {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Transport for AcceptedTransport {
    type Io = TcpStream;
    type Stream = TcpStream;

    async fn connect(&mut self) -> Result<TcpStream, SessionError> {
        let stream = self.stream.take().ok_or_else(|| {
            SessionError::Connect(io::Error::new(
                io::ErrorKind::NotConnected,
                "accepted socket already consumed",
            ))
        })?;
        stream.set_nodelay(true).map_err(SessionError::Connect)?;
        Ok(stream)
    }

    async fn handshake(&mut self, io: TcpStream) -> Result<WebSocketStream<TcpStream>, SessionError> {
        let ws_stream = tokio_tungstenite::accept_async(io)
            .await
            .map_err(SessionError::Handshake)?;
        debug!("Accepted WebSocket handshake from {}", self.peer);
        Ok(ws_stream)
    }
}
