//! ws_hub - Entry Point
//!
//! `serve` runs a relay server that rebroadcasts every message to all other
//! clients. `connect` opens a client session and sends stdin lines.

use std::io::{self, BufRead};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ws_hub::{
    ClientConfig, ClientListener, ErrorKind, Message, ServerConfig, ServerListener, SessionId,
    WsClient, WsServer,
};

#[derive(Debug, Parser)]
#[command(name = "ws_hub", version, about = "WebSocket relay server and client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay every received message to all other connected clients
    Serve {
        /// Bind address (defaults to WS_HOST or 0.0.0.0)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (defaults to WS_PORT or 9001)
        #[arg(long)]
        port: Option<u16>,
        /// Frame relayed payloads as binary
        #[arg(long)]
        binary: bool,
    },
    /// Connect to a server and send each stdin line as a message
    Connect {
        /// ws:// or wss:// URL
        #[arg(env = "WS_URL")]
        url: String,
        /// Send lines as binary frames
        #[arg(long)]
        binary: bool,
        /// Accept any server certificate on wss://
        #[arg(long)]
        insecure: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=ws_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ws_hub=info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { host, port, binary } => {
            let mut config = ServerConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            config.binary |= binary;
            serve(config)
        }
        Command::Connect {
            url,
            binary,
            insecure,
        } => {
            let mut config = ClientConfig::from_env()?;
            config.binary |= binary;
            config.verify_peer &= !insecure;
            connect(&url, config)
        }
    }
}

/// Forwards every received message to the relay thread
struct Relay(mpsc::Sender<(Message, SessionId)>);

impl ServerListener for Relay {
    fn listening(&self) {
        info!("Relay is accepting clients");
    }

    fn closed(&self) {
        info!("Relay closed");
    }

    fn client_connected(&self, id: SessionId) {
        info!("Client {} joined", id);
    }

    fn client_disconnected(&self, id: SessionId) {
        info!("Client {} left", id);
    }

    fn received_text(&self, text: &str, id: SessionId) {
        let _ = self.0.send((Message::from(text), id));
    }

    fn received_binary(&self, data: &[u8], id: SessionId) {
        let _ = self.0.send((Message::from(data), id));
    }
}

fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let (relay_tx, relay_rx) = mpsc::channel();
    let server = Arc::new(WsServer::new(Arc::new(Relay(relay_tx)), config));

    let addr = server.start()?;
    info!("WebSocket relay listening on {}", addr);

    // Relay loop: rebroadcast to everyone but the sender
    let relay = Arc::clone(&server);
    thread::Builder::new()
        .name("ws-relay".to_string())
        .spawn(move || {
            for (message, sender) in relay_rx {
                let delivered = relay.send_to_all(message, Some(sender));
                debug!("Relayed message from {} to {} clients", sender, delivered);
            }
        })?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    info!("Shutting down");
    server.close();
    Ok(())
}

/// Prints session events to the terminal
struct Printer;

impl ClientListener for Printer {
    fn connected(&self) {
        println!("* connected");
    }

    fn disconnected(&self, code: u16) {
        println!("* disconnected ({code})");
    }

    fn error(&self, kind: ErrorKind, message: &str) {
        error!("{} (code {}): {}", kind, kind.code(), message);
    }

    fn received_text(&self, text: &str) {
        println!("< {text}");
    }

    fn received_binary(&self, data: &[u8]) {
        println!("< [{} bytes]", data.len());
    }
}

fn connect(url: &str, config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = WsClient::new(Arc::new(Printer), config);
    client.connect(url)?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "/quit" => break,
            "/reconnect" => {
                if let Err(e) = client.reconnect() {
                    error!("Reconnect failed: {}", e);
                }
            }
            _ => {
                if !client.send_payload(line.into_bytes()) {
                    println!("* not connected, message dropped");
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}
