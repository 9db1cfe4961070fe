//! Reconnecting status channel client.
//!
//! A [`ConnectionManager`] owns one background session task. The task dials
//! the server, pumps inbound envelopes into a broadcast channel and outbound
//! envelopes from an mpsc queue onto the socket, and redials with capped
//! exponential backoff when the socket drops.
//!
//! # Lifecycle
//! 1. `Disconnected` until `connect()` is called
//! 2. `Connecting` while the WebSocket handshake runs, for at most
//!    `connect_timeout`
//! 3. `Connected` once the handshake succeeds (failure count resets)
//! 4. `Reconnecting` while waiting out the backoff delay after a loss or a
//!    failed attempt
//! 5. `Closed` after `close()` or after `max_reconnect_attempts` consecutive
//!    failed attempts; terminal

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use sc_protocol::{EnvelopeError, EnvelopeType, MessageEnvelope};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::bus::StatusBus;
use crate::events::{CloseReason, StatusEvent};

const INBOUND_CAP: usize = 256;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Options / state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Options for [`ConnectionManager::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bearer token sent on every handshake.
    pub token: String,
    /// Redial after a loss. When false a loss ends in `Disconnected`.
    pub reconnect: bool,
    /// First backoff delay; doubles per consecutive failure.
    pub reconnect_interval: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Backoff ceiling.
    pub max_reconnect_interval: Duration,
    /// Upper bound on one dial, TCP connect through the WebSocket upgrade.
    /// An attempt that runs out counts as a failed attempt.
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid auth header: {0}")]
    InvalidToken(String),
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by server")]
    Disconnected,
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// EnvelopeStream
// ---------------------------------------------------------------------------

/// Inbound envelopes, across reconnects, in per-connection arrival order.
///
/// Never ends while the manager exists. A receiver that falls more than
/// the channel capacity behind skips ahead and logs how much it missed.
pub struct EnvelopeStream {
    inner: BroadcastStream<MessageEnvelope>,
}

impl tokio_stream::Stream for EnvelopeStream {
    type Item = MessageEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(envelope)) => return Poll::Ready(Some(envelope)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "envelope subscriber lagged");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Inner {
    server_url: String,
    bus: StatusBus,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    inbound_tx: broadcast::Sender<MessageEnvelope>,
    outbound_tx: mpsc::UnboundedSender<MessageEnvelope>,
    outbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<MessageEnvelope>>>,
    task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Cloneable handle to the single live status connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(server_url: impl Into<String>, bus: StatusBus) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAP);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                server_url: server_url.into(),
                bus,
                state_tx,
                shutdown_tx,
                inbound_tx,
                outbound_tx,
                outbound_rx: Arc::new(Mutex::new(outbound_rx)),
                task: StdMutex::new(None),
            }),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Start the session task. Returns immediately.
    ///
    /// Only acts from `Disconnected`; in every other state the call is a
    /// no-op. Must be called from within a Tokio runtime.
    pub fn connect(&self, options: ConnectOptions) {
        let mut previous = None;
        self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                previous = Some(*state);
                false
            }
        });
        if let Some(state) = previous {
            debug!(?state, "connect ignored");
            return;
        }

        info!(url = %self.inner.server_url, "status channel connecting");
        let task = tokio::spawn(Arc::clone(&self.inner).run_session(options));
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Queue an envelope for delivery. Queued envelopes are written in order
    /// once a connection is up. An envelope whose write fails is written
    /// again, ahead of the rest of the queue, on the next connection.
    pub fn send(&self, envelope: MessageEnvelope) -> Result<(), SendError> {
        if self.state() == ConnectionState::Closed {
            warn!(kind = %envelope.kind, "send on closed connection");
            return Err(SendError::Closed);
        }
        self.inner
            .outbound_tx
            .send(envelope)
            .map_err(|_| SendError::Closed)
    }

    /// Subscribe to inbound envelopes.
    pub fn subscribe(&self) -> EnvelopeStream {
        EnvelopeStream {
            inner: BroadcastStream::new(self.inner.inbound_tx.subscribe()),
        }
    }

    /// Close permanently and cancel any pending reconnect. Idempotent.
    pub fn close(&self) {
        self.inner.close(CloseReason::Requested, None);
    }

    /// Wait for the session task to finish, e.g. after `close()`.
    pub async fn join(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("server_url", &self.inner.server_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Lost(TransportError),
}

impl Inner {
    /// Move to `next` unless already `Closed`. Returns false when closed.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut open = true;
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                open = false;
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        });
        open
    }

    /// Transition to `Closed` once; later calls are no-ops.
    fn close(&self, reason: CloseReason, error: Option<String>) {
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            previous = Some(*state);
            *state = ConnectionState::Closed;
            true
        });
        let Some(previous) = previous else {
            debug!("close ignored: already closed");
            return;
        };
        self.shutdown_tx.send_replace(true);
        match reason {
            CloseReason::Requested => info!(?previous, "status channel closed"),
            CloseReason::RetriesExhausted => {
                warn!(?previous, error = ?error, "status channel gave up reconnecting");
            }
        }
        self.bus.publish(StatusEvent::Closed { reason, error });
    }

    async fn run_session(self: Arc<Self>, options: ConnectOptions) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut outbound = tokio::select! {
            biased;
            () = wait_for_shutdown(&mut shutdown) => return,
            guard = Arc::clone(&self.outbound_rx).lock_owned() => guard,
        };
        let mut backoff = Backoff::new(options.reconnect_interval, options.max_reconnect_interval);
        let mut failures: u32 = 0;
        let mut pending: Option<MessageEnvelope> = None;

        loop {
            if !self.set_state(ConnectionState::Connecting) {
                return;
            }

            let attempt = tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => return,
                result = timeout(
                    options.connect_timeout,
                    open_socket(&self.server_url, &options.token),
                ) => result.unwrap_or_else(|_| {
                    Err(TransportError::HandshakeTimeout(options.connect_timeout))
                }),
            };

            let lost = match attempt {
                Ok(ws) => {
                    failures = 0;
                    backoff.reset();
                    if !self.set_state(ConnectionState::Connected) {
                        return;
                    }
                    info!(url = %self.server_url, "status channel connected");
                    self.bus.publish(StatusEvent::Connected {
                        url: self.server_url.clone(),
                    });
                    match self.pump(ws, &mut outbound, &mut pending, &mut shutdown).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Lost(e) => {
                            warn!(error = %e, "status channel lost");
                            e
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(attempt = failures, error = %e, "status channel connect failed");
                    e
                }
            };

            if !options.reconnect {
                if self.set_state(ConnectionState::Disconnected) {
                    self.bus.publish(StatusEvent::Disconnected {
                        reason: lost.to_string(),
                    });
                }
                return;
            }

            if failures >= options.max_reconnect_attempts {
                self.close(CloseReason::RetriesExhausted, Some(lost.to_string()));
                return;
            }

            if !self.set_state(ConnectionState::Reconnecting) {
                return;
            }
            let delay = backoff.next_delay();
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(attempt = failures + 1, delay_ms, "waiting before reconnect");
            self.bus.publish(StatusEvent::Reconnecting {
                attempt: failures + 1,
                delay_ms,
            });
            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown) => return,
                () = sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<MessageEnvelope>,
        pending: &mut Option<MessageEnvelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut last_timestamp: Option<DateTime<Utc>> = None;

        if let Some(envelope) = pending.take() {
            debug!(kind = %envelope.kind, "retrying held envelope");
            if let Err(e) = write_or_hold(&mut write, envelope, pending).await {
                return SessionEnd::Lost(e);
            }
        }

        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                msg = read.next() => match msg {
                    None => return SessionEnd::Lost(TransportError::Disconnected),
                    Some(Err(e)) => return SessionEnd::Lost(e.into()),
                    Some(Ok(Message::Text(text))) => {
                        let Some(reply) = self.handle_text(&text, &mut last_timestamp) else {
                            continue;
                        };
                        if let Err(e) = send_envelope(&mut write, &reply).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Lost(e.into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server sent close");
                        return SessionEnd::Lost(TransportError::Disconnected);
                    }
                    Some(Ok(_)) => debug!("ignoring non-text frame"),
                },
                Some(envelope) = outbound.recv() => {
                    if let Err(e) = write_or_hold(&mut write, envelope, pending).await {
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Deliver an inbound frame; returns a reply to write back, if any.
    fn handle_text(
        &self,
        text: &str,
        last_timestamp: &mut Option<DateTime<Utc>>,
    ) -> Option<MessageEnvelope> {
        match classify(text) {
            Inbound::Discard(e) => {
                warn!(error = %e, "discarding envelope");
                None
            }
            Inbound::Ping(ping) => {
                track_timestamp(last_timestamp, &ping);
                debug!("ping received");
                Some(MessageEnvelope::new(EnvelopeType::Pong, serde_json::Map::new()))
            }
            Inbound::Pong(pong) => {
                track_timestamp(last_timestamp, &pong);
                debug!("pong received");
                None
            }
            Inbound::Deliver(envelope) => {
                track_timestamp(last_timestamp, &envelope);
                debug!(kind = %envelope.kind, timestamp = %envelope.timestamp, "envelope received");
                if self.inbound_tx.send(envelope).is_err() {
                    debug!("no envelope subscribers");
                }
                None
            }
        }
    }
}

/// What to do with one inbound text frame.
enum Inbound {
    Deliver(MessageEnvelope),
    Ping(MessageEnvelope),
    Pong(MessageEnvelope),
    Discard(EnvelopeError),
}

fn classify(text: &str) -> Inbound {
    let envelope = match MessageEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => return Inbound::Discard(e),
    };
    match envelope.envelope_type() {
        None => Inbound::Discard(EnvelopeError::UnknownType(envelope.kind)),
        Some(EnvelopeType::Ping) => Inbound::Ping(envelope),
        Some(EnvelopeType::Pong) => Inbound::Pong(envelope),
        Some(_) => Inbound::Deliver(envelope),
    }
}

/// Timestamps should not go backwards within one connection; log if they do.
fn track_timestamp(last: &mut Option<DateTime<Utc>>, envelope: &MessageEnvelope) {
    match *last {
        Some(previous) if envelope.timestamp < previous => {
            warn!(
                kind = %envelope.kind,
                timestamp = %envelope.timestamp,
                previous = %previous,
                "envelope timestamp went backwards"
            );
        }
        _ => *last = Some(envelope.timestamp),
    }
}

async fn send_envelope<S>(write: &mut S, envelope: &MessageEnvelope) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = match envelope.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(kind = %envelope.kind, error = %e, "outbound envelope not serializable");
            return Ok(());
        }
    };
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Write `envelope`; on failure park it in `pending` for the next connection.
async fn write_or_hold<S>(
    write: &mut S,
    envelope: MessageEnvelope,
    pending: &mut Option<MessageEnvelope>,
) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    if let Err(e) = send_envelope(write, &envelope).await {
        warn!(kind = %envelope.kind, error = %e, "outbound write failed; holding envelope");
        *pending = Some(envelope);
        return Err(e);
    }
    Ok(())
}

/// Resolves once shutdown is requested (or the sender is gone).
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling delay, capped.
#[derive(Debug, Clone)]
struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        let cap = cap.max(base);
        Self {
            base,
            cap,
            next: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.checked_mul(2).map_or(self.cap, |d| d.min(self.cap));
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

// ---------------------------------------------------------------------------
// WS request with Bearer auth header
// ---------------------------------------------------------------------------

/// Build the upgrade request for `url` carrying `Authorization: Bearer <token>`.
pub fn build_authenticated_request(
    url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;

    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().map_err(
            |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                TransportError::InvalidToken(e.to_string())
            },
        )?,
    );

    Ok(request)
}

async fn open_socket(url: &str, token: &str) -> Result<WsStream, TransportError> {
    let request = build_authenticated_request(url, token)?;
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}
