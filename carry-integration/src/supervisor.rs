use crate::{
    channel::{Tx, UnboundedTx},
    error::SocketError,
    websocket::{self, DEFAULT_CONNECT_TIMEOUT, WsMessage},
};
use carry_instrument::exchange::ExchangeId;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`VenueSocket`] connection.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
    derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of a [`VenueSocket`] connection, exposed to observers via
/// [`VenueSocketHandle::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub last_ping_latency: Option<Duration>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connected_at: None,
            reconnect_count: 0,
            last_ping_latency: None,
        }
    }
}

/// Event emitted by a [`VenueSocket`] towards its consumer.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// Raw text payload received from the venue (heartbeat acks filtered out).
    Message {
        exchange: ExchangeId,
        payload: String,
    },
    Connected {
        exchange: ExchangeId,
    },
    Disconnected {
        exchange: ExchangeId,
    },
    Reconnecting {
        exchange: ExchangeId,
        attempt: u32,
        delay: Duration,
    },
    /// Connection-layer error. Terminal if [`SocketError::is_terminal`], in which case the
    /// socket task has exited and no further events will be emitted.
    Error {
        exchange: ExchangeId,
        error: SocketError,
    },
}

/// Exponential backoff policy applied between reconnection attempts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter_max: Duration::from_millis(1000),
        }
    }
}

/// Deterministic component of the reconnect delay: `base * 2^(attempt - 1)`, capped at
/// `policy.max`. Jitter is added separately by the caller.
pub fn reconnect_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    policy
        .base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(policy.max)
}

/// Configuration for a [`VenueSocket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VenueSocketConfig {
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_reconnect_attempts: u32,
    pub resubscribe_settle: Duration,
}

impl Default for VenueSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            backoff: BackoffPolicy::default(),
            max_reconnect_attempts: 100,
            resubscribe_settle: Duration::from_millis(100),
        }
    }
}

/// Per-venue heartbeat schedule.
///
/// Binance speaks protocol-level ping frames, Bybit a JSON `{"op":"ping"}` envelope, and OKX a
/// bare `ping` text frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Heartbeat {
    NativePing,
    BybitJson,
    OkxText,
}

impl Heartbeat {
    pub fn for_exchange(exchange: ExchangeId) -> Self {
        match exchange {
            ExchangeId::Binance => Heartbeat::NativePing,
            ExchangeId::Bybit => Heartbeat::BybitJson,
            ExchangeId::Okx => Heartbeat::OkxText,
        }
    }

    /// Interval between outbound heartbeats.
    pub fn interval(&self) -> Duration {
        match self {
            // Binance terminates idle connections after ~10 minutes; the server also pings
            // every 3 minutes, which tungstenite answers transparently.
            Heartbeat::NativePing => Duration::from_secs(180),
            // Bybit requires a ping every 20 seconds.
            Heartbeat::BybitJson => Duration::from_secs(20),
            // OKX requires activity within 30 seconds.
            Heartbeat::OkxText => Duration::from_secs(25),
        }
    }

    /// Outbound heartbeat message.
    pub fn ping(&self) -> WsMessage {
        match self {
            Heartbeat::NativePing => WsMessage::Ping(bytes::Bytes::new()),
            Heartbeat::BybitJson => WsMessage::text(r#"{"op":"ping"}"#),
            Heartbeat::OkxText => WsMessage::text("ping"),
        }
    }

    /// Recognise a text frame as a heartbeat ack, which must not reach the consumer.
    pub fn is_pong(&self, payload: &str) -> bool {
        match self {
            Heartbeat::NativePing => false,
            Heartbeat::BybitJson => {
                payload.contains(r#""op":"pong""#) || payload.contains(r#""ret_msg":"pong""#)
            }
            Heartbeat::OkxText => payload.trim() == "pong",
        }
    }
}

/// Command accepted by a running [`VenueSocket`].
#[derive(Debug, Clone)]
enum Command {
    /// Store an opaque subscription payload in the replay ledger and send it if connected.
    Subscribe(String),
    /// Send an unsubscribe payload and drop the matching entry from the replay ledger.
    Unsubscribe { payload: String, remove: String },
    Close,
}

/// Cheap-to-clone control handle for a spawned [`VenueSocket`].
#[derive(Debug, Clone)]
pub struct VenueSocketHandle {
    exchange: ExchangeId,
    command_tx: tokio::sync::mpsc::UnboundedSender<Command>,
    info: Arc<parking_lot::RwLock<ConnectionInfo>>,
}

impl VenueSocketHandle {
    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    /// Register an opaque subscription payload. It is sent immediately if connected, and
    /// replayed verbatim after every reconnect.
    pub fn subscribe<S>(&self, payload: S)
    where
        S: Into<String>,
    {
        let _ = self.command_tx.send(Command::Subscribe(payload.into()));
    }

    /// Send an unsubscribe payload and remove the original subscribe payload from the
    /// replay ledger.
    pub fn unsubscribe<S>(&self, payload: S, remove: S)
    where
        S: Into<String>,
    {
        let _ = self.command_tx.send(Command::Unsubscribe {
            payload: payload.into(),
            remove: remove.into(),
        });
    }

    /// Request a clean shutdown of the socket task.
    pub fn close(&self) {
        let _ = self.command_tx.send(Command::Close);
    }

    /// Snapshot of the current connection state.
    pub fn info(&self) -> ConnectionInfo {
        self.info.read().clone()
    }
}

/// Outcome of driving a live connection.
enum DriveOutcome {
    /// Connection dropped or errored; the supervisor should reconnect.
    Dropped,
    /// Shutdown requested; the supervisor should exit.
    Shutdown,
}

/// Supervised single-venue public-stream WebSocket.
///
/// Owns the connection lifecycle for one venue: connect with timeout, heartbeat on the venue
/// schedule, reconnect with exponential backoff + jitter, and replay of every stored
/// subscription payload after a settle delay.
#[derive(Debug)]
pub struct VenueSocket {
    exchange: ExchangeId,
    url: String,
    config: VenueSocketConfig,
    heartbeat: Heartbeat,
    subscriptions: Vec<String>,
    command_rx: tokio::sync::mpsc::UnboundedReceiver<Command>,
    event_tx: UnboundedTx<SupervisorEvent>,
    info: Arc<parking_lot::RwLock<ConnectionInfo>>,
}

impl VenueSocket {
    /// Spawn the socket task for the provided venue, returning its control handle.
    pub fn spawn(
        exchange: ExchangeId,
        url: String,
        config: VenueSocketConfig,
        event_tx: UnboundedTx<SupervisorEvent>,
    ) -> VenueSocketHandle {
        let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
        let info = Arc::new(parking_lot::RwLock::new(ConnectionInfo::default()));

        let socket = Self {
            exchange,
            url,
            config,
            heartbeat: Heartbeat::for_exchange(exchange),
            subscriptions: Vec::new(),
            command_rx,
            event_tx,
            info: Arc::clone(&info),
        };

        let handle = VenueSocketHandle {
            exchange,
            command_tx,
            info,
        };

        tokio::spawn(socket.run());

        handle
    }

    async fn run(mut self) {
        let mut attempt = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting);

            match websocket::connect(self.url.as_str(), self.config.connect_timeout).await {
                Ok(websocket) => {
                    attempt = 0;
                    {
                        let mut info = self.info.write();
                        info.state = ConnectionState::Connected;
                        info.connected_at = Some(Utc::now());
                    }
                    info!(exchange = %self.exchange, "VenueSocket connected");
                    self.emit(SupervisorEvent::Connected {
                        exchange: self.exchange,
                    });

                    match self.drive(websocket).await {
                        DriveOutcome::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            info!(exchange = %self.exchange, "VenueSocket shut down");
                            return;
                        }
                        DriveOutcome::Dropped => {
                            self.emit(SupervisorEvent::Disconnected {
                                exchange: self.exchange,
                            });
                        }
                    }
                }
                Err(connect_error) => {
                    warn!(
                        exchange = %self.exchange,
                        error = %connect_error,
                        "VenueSocket connect attempt failed"
                    );
                    self.emit(SupervisorEvent::Error {
                        exchange: self.exchange,
                        error: connect_error,
                    });
                }
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                error!(
                    exchange = %self.exchange,
                    attempts = self.config.max_reconnect_attempts,
                    "VenueSocket exhausted reconnection attempts"
                );
                self.set_state(ConnectionState::Disconnected);
                self.emit(SupervisorEvent::Error {
                    exchange: self.exchange,
                    error: SocketError::ReconnectAttemptsExhausted(
                        self.config.max_reconnect_attempts,
                    ),
                });
                return;
            }

            let jitter_max = self.config.backoff.jitter_max.as_millis() as u64;
            let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_max));
            let delay = reconnect_delay(&self.config.backoff, attempt) + jitter;

            {
                let mut info = self.info.write();
                info.state = ConnectionState::Reconnecting;
                info.reconnect_count += 1;
            }
            self.emit(SupervisorEvent::Reconnecting {
                exchange: self.exchange,
                attempt,
                delay,
            });

            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one live connection until it drops or shutdown is requested.
    async fn drive(&mut self, websocket: websocket::WebSocket) -> DriveOutcome {
        let VenueSocket {
            exchange,
            config,
            heartbeat,
            subscriptions,
            command_rx,
            event_tx,
            info,
            ..
        } = self;
        let exchange = *exchange;

        let (mut sink, mut stream) = websocket.split();

        // Settle before replaying subscriptions - venues drop requests sent mid-handshake
        tokio::time::sleep(config.resubscribe_settle).await;
        for payload in subscriptions.iter() {
            debug!(%exchange, payload, "replaying subscription");
            if sink.send(WsMessage::text(payload.clone())).await.is_err() {
                return DriveOutcome::Dropped;
            }
        }

        let mut ping_timer = tokio::time::interval(heartbeat.interval());
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();
        let mut last_ping_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    last_ping_at = Some(Instant::now());
                    if sink.send(heartbeat.ping()).await.is_err() {
                        return DriveOutcome::Dropped;
                    }
                }
                command = command_rx.recv() => match command {
                    Some(Command::Subscribe(payload)) => {
                        subscriptions.push(payload.clone());
                        if sink.send(WsMessage::text(payload)).await.is_err() {
                            return DriveOutcome::Dropped;
                        }
                    }
                    Some(Command::Unsubscribe { payload, remove }) => {
                        subscriptions.retain(|stored| stored != &remove);
                        if sink.send(WsMessage::text(payload)).await.is_err() {
                            return DriveOutcome::Dropped;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return DriveOutcome::Shutdown;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(payload))) => {
                        if heartbeat.is_pong(&payload) {
                            if let Some(sent_at) = last_ping_at.take() {
                                info.write().last_ping_latency = Some(sent_at.elapsed());
                            }
                            continue;
                        }
                        if event_tx
                            .send(SupervisorEvent::Message {
                                exchange,
                                payload: payload.to_string(),
                            })
                            .is_err()
                        {
                            return DriveOutcome::Shutdown;
                        }
                    }
                    Some(Ok(WsMessage::Binary(payload))) => {
                        match String::from_utf8(payload.to_vec()) {
                            Ok(payload) => {
                                if event_tx
                                    .send(SupervisorEvent::Message { exchange, payload })
                                    .is_err()
                                {
                                    return DriveOutcome::Shutdown;
                                }
                            }
                            Err(_) => {
                                debug!(%exchange, "dropping non-utf8 binary frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if sink.send(WsMessage::Pong(payload)).await.is_err() {
                            return DriveOutcome::Dropped;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        if let Some(sent_at) = last_ping_at.take() {
                            info.write().last_ping_latency = Some(sent_at.elapsed());
                        }
                    }
                    Some(Ok(WsMessage::Close(close_frame))) => {
                        debug!(%exchange, ?close_frame, "received CloseFrame");
                        return DriveOutcome::Dropped;
                    }
                    Some(Ok(WsMessage::Frame(_))) => continue,
                    Some(Err(ws_error)) => {
                        if connection_lost(&ws_error) {
                            return DriveOutcome::Dropped;
                        }
                        warn!(%exchange, error = %ws_error, "VenueSocket frame error");
                    }
                    None => return DriveOutcome::Dropped,
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.info.write().state = state;
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Whether a frame error means the connection is gone and the supervisor should move to its
/// reconnect schedule, as opposed to a recoverable per-frame problem (eg/ an oversized or
/// malformed frame) that only costs the single frame.
fn connection_lost(error: &websocket::WsError) -> bool {
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    match error {
        websocket::WsError::ConnectionClosed | websocket::WsError::AlreadyClosed => true,
        // Socket-level IO failure: the peer is unreachable
        websocket::WsError::Io(_) => true,
        websocket::WsError::Protocol(protocol) => {
            matches!(protocol, ProtocolError::SendAfterClosing | ProtocolError::ResetWithoutClosingHandshake)
        }
        _ => false,
    }
}
