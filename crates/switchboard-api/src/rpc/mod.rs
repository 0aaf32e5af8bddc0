//! RPC push socket with auto-reconnect.
//!
//! Modern relays expose a JSON-RPC endpoint over a plain websocket at
//! `ws://{address}/rpc`. One connection carries both directions of
//! traffic: numbered request/response pairs initiated here, and
//! unsolicited notification frames pushed by the device. The socket
//! reconnects with exponential backoff + jitter when the connection
//! drops and reports every transition through a state callback.
//!
//! # Example
//!
//! ```rust,ignore
//! use switchboard_api::rpc::{RpcRequest, RpcSocket, SocketConfig};
//! use url::Url;
//!
//! let socket = RpcSocket::new(Url::parse("ws://192.168.1.50/rpc")?, SocketConfig::default());
//! socket.subscribe(std::sync::Arc::new(|raw| println!("push: {raw}")));
//! socket.connect().await?;
//!
//! let status = socket.call(RpcRequest::status()).await?;
//! socket.close();
//! ```

mod frame;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::Error;

pub use frame::RpcRequest;
use frame::RpcEnvelope;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const WRITE_CHANNEL_CAPACITY: usize = 64;

// ── SocketState ──────────────────────────────────────────────────────

/// Connection state reported through [`RpcSocket::on_state_change`].
///
/// `Connecting → Connected` on the initial dial, then
/// `Disconnected → Reconnecting → Connected` cycles while the device
/// flaps. `Closed` is terminal: emitted once when the socket is closed
/// or the retry limit is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected { reason: String },
    Closed,
}

/// Callback invoked on every state transition.
///
/// Runs on the socket's internal task and must not block.
pub type StateHandler = Arc<dyn Fn(SocketState) + Send + Sync>;

/// Callback invoked with each raw notification frame.
///
/// Runs on the socket's internal task and must not block.
pub type NotificationHandler = Arc<dyn Fn(&str) + Send + Sync>;

// ── Configuration ────────────────────────────────────────────────────

/// Exponential backoff configuration for socket reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Tuning for a single RPC socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,

    /// Timeout for a single RPC call. Default: 10s.
    pub call_timeout: Duration,

    /// Interval between keepalive pings. Default: 30s.
    pub ping_interval: Duration,

    /// `src` identifier stamped on outgoing frames. The device uses it
    /// as the notification destination for this client.
    pub client_id: String,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            call_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            client_id: "switchboard".into(),
        }
    }
}

// ── RpcSocket ────────────────────────────────────────────────────────

/// JSON-RPC client over a device websocket.
///
/// Cheaply cloneable; all clones share one connection. Create with
/// [`new`](Self::new), install handlers, then [`connect`](Self::connect)
/// once. [`close`](Self::close) tears the connection down for good.
#[derive(Clone)]
pub struct RpcSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    url: Url,
    config: SocketConfig,
    /// Frame id allocator for request/response correlation.
    next_id: AtomicU64,
    /// In-flight calls awaiting a response frame, keyed by frame id.
    pending: DashMap<u64, oneshot::Sender<Result<Value, Error>>>,
    write_tx: mpsc::Sender<Message>,
    /// Receiver half, taken by the connection task on first connect.
    write_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    state_handler: RwLock<Option<StateHandler>>,
    notification_handler: RwLock<Option<NotificationHandler>>,
    connected: AtomicBool,
    cancel: CancellationToken,
}

/// How a single websocket session ended.
enum SessionEnd {
    /// The socket was closed locally.
    Cancelled,
    /// The connection dropped (close frame, stream end, or transport error).
    Dropped(String),
}

impl RpcSocket {
    /// Create an unconnected socket for the given `ws://` URL.
    pub fn new(url: Url, config: SocketConfig) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SocketInner {
                url,
                config,
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
                state_handler: RwLock::new(None),
                notification_handler: RwLock::new(None),
                connected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Install the notification handler, replacing any previous one.
    ///
    /// Install before [`connect`](Self::connect) to avoid missing frames
    /// the device pushes immediately after the handshake.
    pub fn subscribe(&self, handler: NotificationHandler) {
        *self
            .inner
            .notification_handler
            .write()
            .expect("handler lock poisoned") = Some(handler);
    }

    /// Install the state-change handler, replacing any previous one.
    pub fn on_state_change(&self, handler: StateHandler) {
        *self
            .inner
            .state_handler
            .write()
            .expect("handler lock poisoned") = Some(handler);
    }

    /// Dial the device and spawn the connection task.
    ///
    /// The initial dial happens inline: on failure the error is returned,
    /// no task is spawned, and `connect` may be called again. On success
    /// the socket reports `Connected` and keeps itself alive through
    /// reconnection cycles until [`close`](Self::close).
    pub async fn connect(&self) -> Result<(), Error> {
        let Some(write_rx) = self.inner.write_rx.lock().await.take() else {
            return Err(Error::SocketConnect("socket already started".into()));
        };

        self.emit_state(SocketState::Connecting);

        let stream = match dial(&self.inner.url).await {
            Ok(stream) => stream,
            Err(e) => {
                // Hand the receiver back so connect can be retried.
                *self.inner.write_rx.lock().await = Some(write_rx);
                return Err(e);
            }
        };

        self.inner.connected.store(true, Ordering::SeqCst);
        self.emit_state(SocketState::Connected);

        let socket = self.clone();
        tokio::spawn(async move {
            socket.run_loop(stream, write_rx).await;
        });
        Ok(())
    }

    /// Whether the socket currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Issue an RPC call and await the device's response.
    ///
    /// Fails fast with [`Error::NotConnected`] when no connection is up,
    /// with [`Error::SocketClosed`] if the connection drops mid-call, and
    /// with [`Error::Timeout`] after the configured call timeout.
    pub async fn call(&self, request: RpcRequest) -> Result<Value, Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let wire = request.to_wire(id, &self.inner.config.client_id);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        if self
            .inner
            .write_tx
            .send(Message::Text(wire.into()))
            .await
            .is_err()
        {
            self.inner.pending.remove(&id);
            return Err(Error::SocketClosed);
        }

        let timeout = self.inner.config.call_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped: the connection died and pending calls were failed.
            Ok(Err(_)) => Err(Error::SocketClosed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(Error::Timeout {
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    /// Tear the connection down. Non-blocking and idempotent.
    ///
    /// In-flight calls fail with [`Error::SocketClosed`]; the state
    /// handler sees a final `Closed` once the connection task exits.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    // ── Connection task ──────────────────────────────────────────────

    async fn run_loop(&self, first: WsStream, mut write_rx: mpsc::Receiver<Message>) {
        let mut attempt: u32 = 0;
        let mut stream = Some(first);
        // The first session was announced by connect().
        let mut announced = true;

        loop {
            let session = match stream.take() {
                Some(session) => session,
                None => match self.redial(&mut attempt).await {
                    Some(session) => session,
                    // Cancelled or retry limit reached; Closed already emitted.
                    None => return,
                },
            };

            if !announced {
                self.inner.connected.store(true, Ordering::SeqCst);
                self.emit_state(SocketState::Connected);
            }
            announced = false;
            attempt = 0;

            let end = self.run_session(session, &mut write_rx).await;

            self.inner.connected.store(false, Ordering::SeqCst);
            self.fail_pending();

            match end {
                SessionEnd::Cancelled => {
                    self.emit_state(SocketState::Closed);
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    warn!(url = %self.inner.url, reason = %reason, "push socket disconnected");
                    self.emit_state(SocketState::Disconnected { reason });
                }
            }
        }
    }

    /// Reconnect with exponential backoff. Returns `None` when the socket
    /// is closed or the retry limit is reached (terminal `Closed` emitted).
    async fn redial(&self, attempt: &mut u32) -> Option<WsStream> {
        let reconnect = &self.inner.config.reconnect;

        loop {
            if let Some(max) = reconnect.max_retries {
                if *attempt >= max {
                    warn!(max_retries = max, "reconnection limit reached, giving up");
                    self.emit_state(SocketState::Closed);
                    return None;
                }
            }

            let delay = calculate_backoff(*attempt, reconnect);
            debug!(
                delay_ms = delay.as_millis() as u64,
                attempt = *attempt,
                "waiting before reconnect"
            );

            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    self.emit_state(SocketState::Closed);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            *attempt += 1;
            self.emit_state(SocketState::Reconnecting { attempt: *attempt });

            match dial(&self.inner.url).await {
                Ok(stream) => return Some(stream),
                Err(e) => debug!(error = %e, attempt = *attempt, "redial failed"),
            }
        }
    }

    /// Drive a single websocket session until it ends.
    async fn run_session(
        &self,
        session: WsStream,
        write_rx: &mut mpsc::Receiver<Message>,
    ) -> SessionEnd {
        let (mut write, mut read) = session.split();

        let mut ping = tokio::time::interval(self.inner.config.ping_interval);
        ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    // Best-effort close frame; the device drops us either way.
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.route_frame(text.as_str()),
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite handles pong replies automatically
                            trace!("socket ping");
                        }
                        Some(Ok(Message::Close(close))) => {
                            let reason = match close {
                                Some(cf) => format!("close frame ({}): {}", cf.code, cf.reason),
                                None => "close frame".into(),
                            };
                            return SessionEnd::Dropped(reason);
                        }
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        None => return SessionEnd::Dropped("stream ended".into()),
                        _ => {
                            // Binary, Pong, Frame -- ignore
                        }
                    }
                }
                outgoing = write_rx.recv() => {
                    // The inner struct holds a sender, so recv never yields None.
                    let Some(message) = outgoing else {
                        return SessionEnd::Dropped("write channel closed".into());
                    };
                    if let Err(e) = write.send(message).await {
                        return SessionEnd::Dropped(format!("write failed: {e}"));
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        return SessionEnd::Dropped(format!("ping failed: {e}"));
                    }
                }
            }
        }
    }

    // ── Frame routing ────────────────────────────────────────────────

    /// Route one text frame: responses complete pending calls,
    /// notifications go to the subscribed handler.
    fn route_frame(&self, raw: &str) {
        let envelope: RpcEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "unparseable frame, dropping");
                return;
            }
        };

        if let Some(method) = envelope.method.as_deref() {
            trace!(method, "notification frame");
            let handler = self
                .inner
                .notification_handler
                .read()
                .expect("handler lock poisoned")
                .clone();
            if let Some(handler) = handler {
                handler(raw);
            }
            return;
        }

        let Some(id) = envelope.id else {
            debug!("frame without id or method, dropping");
            return;
        };

        let Some((_, tx)) = self.inner.pending.remove(&id) else {
            debug!(id, "response for unknown call id, dropping");
            return;
        };

        let result = match (envelope.result, envelope.error) {
            (_, Some(err)) => Err(Error::Rpc {
                code: err.code,
                message: err.message,
            }),
            (Some(value), None) => Ok(value),
            // Methods with no return value respond with neither field.
            (None, None) => Ok(Value::Null),
        };
        let _ = tx.send(result);
    }

    /// Fail every in-flight call so callers don't sit out the full
    /// call timeout after a disconnect.
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Err(Error::SocketClosed));
            }
        }
    }

    fn emit_state(&self, state: SocketState) {
        trace!(url = %self.inner.url, ?state, "socket state");
        let handler = self
            .inner
            .state_handler
            .read()
            .expect("handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }
}

// ── Dialing and backoff ──────────────────────────────────────────────

async fn dial(url: &Url) -> Result<WsStream, Error> {
    debug!(%url, "dialing push socket");
    let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::SocketConnect(e.to_string()))?;
    Ok(stream)
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms when a whole fleet
/// drops at once (e.g. after a network blip).
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
