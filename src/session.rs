//! Session state machine
//!
//! A session is split in two halves:
//! - `Session`, the handle kept by the owner (registry or client controller).
//!   It can be used from any thread to send and close.
//! - `SessionTask`, which runs on the owning execution context and is the only
//!   code that touches the transport. Reads and writes of one session run
//!   inside this single task, so per-session I/O is serialized.
//!
//! Lifecycle: `Connecting -> Handshaking -> Open -> Closing -> Closed`, with
//! any state able to fall through to `Closed` on failure. The observer sees
//! `on_open` at most once, `on_error` at most once, and `on_closed` exactly
//! once, in that order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, timeout_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as Frame};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::message::Message;
use crate::queue::{Enqueued, MessageQueue};
use crate::transport::Transport;
use crate::types::{SessionId, SessionState};

/// Receives a session's lifecycle events on its execution context
pub trait SessionObserver: Send + Sync + 'static {
    fn on_open(&self, id: SessionId);
    fn on_message(&self, id: SessionId, message: Message);
    fn on_error(&self, id: SessionId, error: &SessionError);
    fn on_closed(&self, id: SessionId, code: u16);
}

/// State shared by the handle and the task
struct Shared {
    id: SessionId,
    state: Mutex<SessionState>,
    queue: MessageQueue,
    /// Hands the first message of an idle queue to the writer
    transmit: mpsc::UnboundedSender<Message>,
    close: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `to` only if the session is still in `from`
    fn advance(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn request_close(&self) -> bool {
        let mut state = self.state.lock();
        if !state.accepts_sends() {
            return false;
        }
        *state = SessionState::Closing;
        self.close.send_replace(true);
        true
    }
}

/// Handle to one connection
///
/// Not `Clone`: the registry or the client controller is the single owner,
/// everyone else refers to the session by its `SessionId`.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session in `Connecting` and the task that drives it
    ///
    /// Nothing happens on the network until the task is run with a transport.
    pub fn new(observer: Arc<dyn SessionObserver>, config: SessionConfig) -> (Self, SessionTask) {
        let (transmit, transmit_rx) = mpsc::unbounded_channel();
        let (close, close_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: SessionId::new(),
            state: Mutex::new(SessionState::Connecting),
            queue: MessageQueue::new(),
            transmit,
            close,
        });

        let task = SessionTask {
            shared: Arc::clone(&shared),
            observer,
            transmit_rx,
            close_rx,
            config,
        };

        (Self { shared }, task)
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True only while `Open`
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Queue a message for the peer
    ///
    /// Messages sent before the handshake completes are flushed once the
    /// session opens. Returns `false` (and drops the message) once the session
    /// is closing or closed.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        if !self.state().accepts_sends() {
            trace!(session_id = %self.shared.id, "Dropping message for closed session");
            return false;
        }

        match self.shared.queue.enqueue(message.into()) {
            Enqueued::Transmit(message) => {
                // Only fails once the task is gone, and then the message is moot
                let _ = self.shared.transmit.send(message);
                true
            }
            Enqueued::Queued => true,
            Enqueued::Rejected => false,
        }
    }

    /// Request an orderly close
    ///
    /// Idempotent: only the first call from `Connecting`, `Handshaking` or
    /// `Open` has an effect.
    pub fn close(&self) {
        if self.shared.request_close() {
            debug!(session_id = %self.shared.id, "Close requested");
        }
    }

    /// Outbound messages not yet written, including the one in flight
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

/// The I/O half of a session
pub struct SessionTask {
    shared: Arc<Shared>,
    observer: Arc<dyn SessionObserver>,
    transmit_rx: mpsc::UnboundedReceiver<Message>,
    close_rx: watch::Receiver<bool>,
    config: SessionConfig,
}

impl SessionTask {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Drive the session to completion over `transport`
    pub async fn run<T: Transport>(mut self, mut transport: T) {
        let outcome = self.drive(&mut transport).await;
        self.finish(outcome);
    }

    /// Returns the close code to report, or the failure that ended the session
    async fn drive<T: Transport>(&mut self, transport: &mut T) -> Result<u16, SessionError> {
        let id = self.shared.id;
        let config = self.config;

        let io = tokio::select! {
            _ = close_requested(&mut self.close_rx) => {
                debug!(session_id = %id, "Closed while connecting");
                return Ok(0);
            }
            io = timeout(config.connect_timeout, transport.connect()) => {
                io.map_err(|_| SessionError::ConnectTimeout(config.connect_timeout))??
            }
        };

        if !self
            .shared
            .advance(SessionState::Connecting, SessionState::Handshaking)
        {
            return Ok(0);
        }

        let mut ws_stream = tokio::select! {
            _ = close_requested(&mut self.close_rx) => {
                debug!(session_id = %id, "Closed while handshaking");
                return Ok(0);
            }
            ws = timeout(config.handshake_timeout, transport.handshake(io)) => {
                ws.map_err(|_| SessionError::HandshakeTimeout(config.handshake_timeout))??
            }
        };

        if !self.shared.advance(SessionState::Handshaking, SessionState::Open) {
            // close() landed right as the handshake finished
            let _ = timeout(config.close_timeout, ws_stream.close(None)).await;
            return Ok(0);
        }

        info!(session_id = %id, "Session open");
        self.observer.on_open(id);

        self.pump(ws_stream).await
    }

    /// Run the read and write loops of an open session
    async fn pump<S>(&mut self, ws_stream: WebSocketStream<S>) -> Result<u16, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let config = self.config;
        let (sink, stream) = ws_stream.split();

        let reader = read_loop(
            stream,
            &self.shared,
            self.observer.as_ref(),
            config.idle_timeout,
        );
        let writer = write_loop(
            sink,
            &mut self.transmit_rx,
            &mut self.close_rx,
            &self.shared.queue,
            &config,
        );
        tokio::pin!(reader);
        tokio::pin!(writer);

        tokio::select! {
            read = &mut reader => read,
            written = &mut writer => {
                if written.map_err(SessionError::Write)? == WriteEnd::Stalled {
                    debug!(session_id = %self.shared.id, "Peer stopped reading, dropping connection");
                    return Ok(0);
                }

                // Our close frame is out; keep draining until the peer answers
                match timeout(config.close_timeout, reader).await {
                    Ok(Ok(code)) => Ok(code),
                    Ok(Err(e)) => {
                        debug!(session_id = %self.shared.id, "Read ended after close: {}", e);
                        Ok(0)
                    }
                    Err(_) => {
                        debug!(session_id = %self.shared.id, "Peer did not confirm close");
                        Ok(0)
                    }
                }
            }
        }
    }

    fn finish(self, outcome: Result<u16, SessionError>) {
        let id = self.shared.id;
        let dropped = self.shared.queue.close();
        *self.shared.state.lock() = SessionState::Closed;

        if dropped > 0 {
            debug!(session_id = %id, dropped, "Discarded undelivered messages");
        }

        let code = match outcome {
            Ok(code) => code,
            Err(error) => {
                warn!(session_id = %id, kind = %error.kind(), "Session failed: {}", error);
                self.observer.on_error(id, &error);
                0
            }
        };

        info!(session_id = %id, code, "Session closed");
        self.observer.on_closed(id, code);
    }
}

impl fmt::Debug for SessionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTask")
            .field("id", &self.shared.id)
            .field("config", &self.config)
            .finish()
    }
}

/// Resolves once a close has been requested
async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which only happens at teardown
    let _ = close_rx.wait_for(|closing| *closing).await;
}

/// Deliver inbound messages until the stream ends
///
/// Returns the peer's close code (0 if it sent none). With an idle timeout,
/// the peer must send something (a pong will do) at least that often.
async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    shared: &Shared,
    observer: &dyn SessionObserver,
    idle_timeout: Option<Duration>,
) -> Result<u16, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = shared.id;
    let idle_timeout = idle_timeout.filter(|limit| !limit.is_zero());
    let mut code = 0;

    loop {
        let frame = match idle_timeout {
            Some(limit) => timeout(limit, stream.next())
                .await
                .map_err(|_| SessionError::IdleTimeout(limit))?,
            None => stream.next().await,
        };
        let Some(frame) = frame else {
            break;
        };

        match frame {
            Ok(Frame::Text(text)) => observer.on_message(id, Message::Text(text)),
            Ok(Frame::Binary(data)) => observer.on_message(id, Message::Binary(data)),
            Ok(Frame::Ping(_)) | Ok(Frame::Pong(_)) => {
                // Pong is handled automatically by tungstenite
                trace!(session_id = %id, "Control frame");
            }
            Ok(Frame::Close(frame)) => {
                code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                shared.advance(SessionState::Open, SessionState::Closing);
                debug!(session_id = %id, code, "Peer sent close frame");
            }
            Ok(Frame::Frame(_)) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => return Err(SessionError::Read(e)),
        }
    }

    Ok(code)
}

/// How the write loop ended without a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteEnd {
    /// Our close frame went out (or could not be encoded); wait for the reply
    Closed,
    /// A write was still blocked when the close deadline passed
    Stalled,
}

/// Write queued messages one at a time until a close is requested
///
/// At most one message is handed to the sink at a time: the next one is taken
/// from the queue only after the previous write completed. A close request
/// starts a single `close_timeout` deadline shared by the write in flight, any
/// messages still queued and our close frame.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Frame>,
    transmit_rx: &mut mpsc::UnboundedReceiver<Message>,
    close_rx: &mut watch::Receiver<bool>,
    queue: &MessageQueue,
    config: &SessionConfig,
) -> Result<WriteEnd, tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pings = keep_alive(config.ping_interval);
    let mut deadline = None;

    loop {
        tokio::select! {
            biased;

            Some(first) = transmit_rx.recv() => {
                let mut next = Some(first);
                while let Some(message) = next {
                    let frame = message.into();
                    let Some(result) =
                        send_frame(&mut sink, frame, close_rx, &mut deadline, config.close_timeout).await
                    else {
                        return Ok(WriteEnd::Stalled);
                    };
                    next = queue.complete(&result);
                    result?;
                }
            }
            _ = close_requested(close_rx) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let at = *deadline.get_or_insert_with(|| Instant::now() + config.close_timeout);
                return match timeout_at(at, sink.send(Frame::Close(Some(frame)))).await {
                    Ok(Ok(())) => {
                        trace!("Close frame sent");
                        Ok(WriteEnd::Closed)
                    }
                    Ok(Err(e)) => {
                        debug!("Close frame not sent: {}", e);
                        Ok(WriteEnd::Closed)
                    }
                    Err(_) => {
                        debug!("Timed out sending close frame");
                        Ok(WriteEnd::Stalled)
                    }
                };
            }
            _ = next_ping(&mut pings) => {
                trace!("Sending keep-alive ping");
                let ping = Frame::Ping(Vec::new());
                match send_frame(&mut sink, ping, close_rx, &mut deadline, config.close_timeout).await {
                    Some(result) => result?,
                    None => return Ok(WriteEnd::Stalled),
                }
            }
        }
    }
}

/// Write one frame, giving up on it once a close deadline passes
///
/// Before a close is requested the write may take as long as it needs. After
/// that it must finish by the shared `deadline`; `None` means it did not.
async fn send_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Frame>,
    frame: Frame,
    close_rx: &mut watch::Receiver<bool>,
    deadline: &mut Option<Instant>,
    close_timeout: Duration,
) -> Option<Result<(), tungstenite::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let send = sink.send(frame);
    tokio::pin!(send);

    if deadline.is_none() {
        tokio::select! {
            result = &mut send => return Some(result),
            _ = close_requested(close_rx) => {}
        }
    }

    let at = *deadline.get_or_insert_with(|| Instant::now() + close_timeout);
    timeout_at(at, send).await.ok()
}

fn keep_alive(period: Option<Duration>) -> Option<Interval> {
    period.filter(|period| !period.is_zero()).map(|period| {
        let mut pings = interval_at(Instant::now() + period, period);
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
        pings
    })
}

/// Resolves on the next ping tick; never when pings are off
async fn next_ping(pings: &mut Option<Interval>) {
    match pings {
        Some(pings) => {
            pings.tick().await;
        }
        None => std::future::pending().await,
    }
}
