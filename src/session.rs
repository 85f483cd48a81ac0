//! WebSocket transport session
//!
//! Owns the connection lifecycle: dial, request a snapshot, pump messages,
//! heartbeat, and reconnect with capped exponential backoff when the link
//! drops. All state transitions go through the store so the rest of the
//! process observes exactly one connection status at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::reconcile::CommandSink;
use crate::state::{ConnectionStatus, StateStore};

/// Interval between outbound heartbeat pings
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The link is declared dead when nothing arrives for this long
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(75_000);

/// Reconnect attempts before the session gives up for good
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (1-based): 500ms doubling,
/// capped at 30s
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    BACKOFF_BASE
        .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP)
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server closed the connection")]
    Closed,

    #[error("no data received for {0:?}")]
    LivenessTimeout(Duration),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to the transport session. Cheap to clone; all clones share the
/// same underlying connection.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    url: String,
    store: Arc<StateStore>,
    event_tx: mpsc::UnboundedSender<ServerMessage>,
    /// Present only while the socket is up
    out_tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    /// Guards against a second run loop
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TransportSession {
    /// Create a session for `url`. Inbound server messages are delivered on
    /// the returned receiver in arrival order.
    pub fn new(
        url: impl Into<String>,
        store: Arc<StateStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let session = Self {
            inner: Arc::new(SessionInner {
                url: url.into(),
                store,
                event_tx,
                out_tx: Mutex::new(None),
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
        };
        (session, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Start the connection loop. Idempotent: while a loop is already
    /// running (connecting or connected) this is a no-op.
    pub fn connect(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connect ignored, session already running");
            return;
        }
        // A user-initiated retry starts with a fresh attempt budget and no
        // leftover shutdown request
        let _ = self.inner.shutdown_tx.send(false);
        self.inner.store.reset_reconnect_attempts();
        let session = self.clone();
        tokio::spawn(async move {
            session.run().await;
            session.inner.running.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the session and any pending reconnect wait
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Queue a command for delivery. Returns false (and drops the command)
    /// when the session is not connected; callers must not treat this as
    /// buffered-for-later.
    pub fn send(&self, cmd: ClientMessage) -> bool {
        if self.inner.store.connection().status != ConnectionStatus::Connected {
            trace!(?cmd, "Command dropped, not connected");
            return false;
        }
        let guard = self.inner.out_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    async fn run(&self) {
        let inner = &self.inner;
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            inner.store.set_connecting(&inner.url);
            info!(url = %inner.url, "Connecting");

            match connect_async(inner.url.as_str()).await {
                Ok((stream, _)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    // Snapshot request goes out first, before any caller
                    // can queue a command on the fresh socket. The outbound
                    // path must be in place before the Connected transition
                    // publishes: a subscriber reacting to it may call send()
                    // immediately.
                    let _ = tx.send(ClientMessage::GetFullState);
                    *inner.out_tx.lock() = Some(tx);
                    inner.store.set_connected();
                    info!(url = %inner.url, "Connected");

                    let reason = self.pump(stream, rx, &mut shutdown_rx).await;
                    *inner.out_tx.lock() = None;

                    if *shutdown_rx.borrow() {
                        break;
                    }
                    match reason {
                        Ok(()) => break,
                        Err(err) => {
                            warn!(%err, "Connection lost");
                            inner.store.record_error(&err.to_string());
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, "Connect failed");
                    inner.store.record_error(&err.to_string());
                }
            }

            let attempts = inner.store.connection().reconnect_attempts;
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!(attempts, "Giving up on reconnecting");
                inner
                    .store
                    .set_terminal_error("reconnect attempt limit reached");
                break;
            }

            let delay = backoff_delay(attempts);
            debug!(attempts, ?delay, "Backing off before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        if self.inner.store.connection().status != ConnectionStatus::Error {
            inner.store.set_disconnected();
        }
        info!("Session stopped");
    }

    /// Drive one live socket until it fails, goes silent, or we shut down.
    /// `Ok(())` means a deliberate local shutdown.
    async fn pump(
        &self,
        stream: WsStream,
        mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let (mut sink, mut source) = stream.split();
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                cmd = out_rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    let text = match serde_json::to_string(&cmd) {
                        Ok(text) => text,
                        Err(err) => {
                            // Serialization of our own types failing is a bug,
                            // not a connection problem
                            error!(%err, "Failed to serialize outbound command");
                            continue;
                        }
                    };
                    trace!(%text, "-> server");
                    sink.send(Message::Text(text)).await?;
                }
                msg = source.next() => {
                    let msg = msg.ok_or(SessionError::Closed)??;
                    last_rx = Instant::now();
                    match msg {
                        Message::Text(text) => {
                            trace!(%text, "<- server");
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(event) => {
                                    let _ = self.inner.event_tx.send(event);
                                }
                                Err(err) => {
                                    // Tolerate unknown messages from newer servers
                                    warn!(%err, %text, "Unparseable server message ignored");
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            sink.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(_) => return Err(SessionError::Closed),
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if last_rx.elapsed() > LIVENESS_TIMEOUT {
                        return Err(SessionError::LivenessTimeout(LIVENESS_TIMEOUT));
                    }
                    let text = serde_json::to_string(&ClientMessage::Ping)
                        .unwrap_or_else(|_| r#"{"type":"Ping"}"#.to_string());
                    sink.send(Message::Text(text)).await?;
                }
            }
        }
    }
}

impl CommandSink for TransportSession {
    fn send(&self, cmd: ClientMessage) -> bool {
        TransportSession::send(self, cmd)
    }
}

/// Wait (with timeout) for the store to report `Connected`
#[cfg(test)]
async fn wait_for_connected(store: &StateStore) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if store.connection().status == ConnectionStatus::Connected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
