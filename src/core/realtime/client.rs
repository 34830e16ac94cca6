//! Realtime conversation client.
//!
//! [`RealtimeClient`] owns the connection, the reconnection scheduler and the
//! turn arbiter for one conversation session. Inbound binary frames are
//! agent audio and go to the audio-output listeners untouched; inbound text
//! frames are parsed into [`ServerEvent`]s and dispatched by kind.
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_voice_client::core::realtime::{EventKind, RealtimeClient, RealtimeClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RealtimeClientConfig {
//!         base_url: "wss://voice.example.com/ws".to_string(),
//!         auth_token: Some("token".to_string()),
//!         ..Default::default()
//!     };
//!
//!     let client = RealtimeClient::with_websocket(config).unwrap();
//!     let _turns = client.on_turn_change(|change| {
//!         println!("user may speak: {}", change.can_send_input);
//!     });
//!     let _transcripts = client.on_event(EventKind::Transcript, |event| {
//!         println!("{event:?}");
//!     });
//!
//!     client.connect().await.unwrap();
//!     client.send_binary_frame(pcm_bytes).unwrap();
//! }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::dispatch::EventDispatcher;
use super::messages::{ClientCommand, EventKind, ServerEvent, raw_command_json};
use crate::core::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use crate::core::error::{ClientError, ClientResult};
use crate::core::events::{Listeners, Subscription};
use crate::core::reconnection::{ReconnectionEvent, ReconnectionManager, ReconnectionPolicy};
use crate::core::transport::{CloseCode, Transport, WebSocketTransport, WireMessage};
use crate::core::turn::{TurnArbiter, TurnChange};
use crate::utils::connection_url::{build_connection_url, redact_url, validate_base_url};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    /// Not connected. Initial and terminal state.
    #[default]
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Reconnecting after connection loss
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    /// Terminal disconnect. Not emitted while a reconnection is pending.
    Disconnected {
        code: CloseCode,
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Reconnected {
        attempts: u32,
    },
    ReconnectionFailed {
        reason: String,
    },
    /// A recoverable failure. The connection stays up unless a state change
    /// follows.
    Error(String),
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine-level configuration.
#[derive(Clone)]
pub struct RealtimeClientConfig {
    /// Base WebSocket URL; `token` and `session_id` are appended per connect.
    pub base_url: String,
    /// Auth token. Required to connect.
    pub auth_token: Option<String>,
    /// Session to resume.
    pub session_id: Option<String>,
    pub connect_timeout: Duration,
    /// `None` disables the application-level heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// `enabled` doubles as the auto-reconnect switch.
    pub reconnection: ReconnectionPolicy,
    pub user_starts_with_turn: bool,
}

impl Default for RealtimeClientConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            base_url: "ws://localhost:3001/ws".to_string(),
            auth_token: None,
            session_id: None,
            connect_timeout: connection.connect_timeout,
            heartbeat_interval: connection.heartbeat_interval,
            reconnection: ReconnectionPolicy::default(),
            user_starts_with_turn: false,
        }
    }
}

impl fmt::Debug for RealtimeClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClientConfig")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("session_id", &self.session_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnection", &self.reconnection)
            .field("user_starts_with_turn", &self.user_starts_with_turn)
            .finish()
    }
}

#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct Credentials {
    token: Option<String>,
    session_id: Option<String>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub text_frames_sent: u64,
    pub binary_frames_sent: u64,
    pub bytes_sent: u64,
    pub text_frames_received: u64,
    pub binary_frames_received: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
    /// Commands sent on the current connection.
    pub commands_sent: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct StatsCounters {
    text_frames_sent: AtomicU64,
    binary_frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    text_frames_received: AtomicU64,
    binary_frames_received: AtomicU64,
    bytes_received: AtomicU64,
    parse_errors: AtomicU64,
    commands_sent: AtomicU64,
    reconnects: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ClientStats {
        ClientStats {
            text_frames_sent: self.text_frames_sent.load(Ordering::Relaxed),
            binary_frames_sent: self.binary_frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            text_frames_received: self.text_frames_received.load(Ordering::Relaxed),
            binary_frames_received: self.binary_frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

struct EventChannels {
    connection: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Reconnection events stamped with the session epoch at emission.
    reconnection: mpsc::UnboundedReceiver<(u64, ReconnectionEvent)>,
}

struct ClientInner {
    config: RealtimeClientConfig,
    base_url: Url,
    credentials: RwLock<Credentials>,
    state: RwLock<ConnectionState>,
    connection: ConnectionManager,
    reconnection: ReconnectionManager,
    turn: TurnArbiter,
    dispatcher: EventDispatcher,
    audio_output: Listeners<Bytes>,
    lifecycle: Listeners<LifecycleEvent>,
    stats: StatsCounters,
    /// Set by disconnect() to suppress reconnection.
    intentional_disconnect: AtomicBool,
    /// Bumped by every connect() and disconnect(). Work started under an
    /// older epoch must not change state or fire events.
    epoch: Arc<AtomicU64>,
    /// Held while a state change and its events are committed, so commits
    /// from connect attempts, the event loop and disconnect() never
    /// interleave. Reentrant for listeners that call back into the client.
    transition: ReentrantMutex<()>,
    destroyed: AtomicBool,
    channels: Mutex<Option<EventChannels>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Client for one realtime conversation session.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

/// Non-owning handle to a [`RealtimeClient`].
#[derive(Clone, Default)]
pub struct WeakRealtimeClient {
    inner: Weak<ClientInner>,
}

impl WeakRealtimeClient {
    pub fn upgrade(&self) -> Option<RealtimeClient> {
        self.inner.upgrade().map(|inner| RealtimeClient { inner })
    }

    /// Whether this handle points at `client`.
    pub fn is(&self, client: &RealtimeClient) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&client.inner))
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.state())
            .field("base_url", &self.inner.config.base_url)
            .finish()
    }
}

impl RealtimeClient {
    /// Create a client over `transport`. Nothing is connected yet.
    pub fn new(config: RealtimeClientConfig, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        let mut config = config;
        let base_url = validate_base_url(&config.base_url)
            .map_err(|e| ClientError::InvalidConfiguration(e.to_string()))?;

        let credentials = Credentials {
            token: config.auth_token.take(),
            session_id: config.session_id.take(),
        };

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (reconnection_tx, reconnection_rx) = mpsc::unbounded_channel();

        let connection = ConnectionManager::new(
            transport,
            ConnectionConfig {
                connect_timeout: config.connect_timeout,
                heartbeat_interval: config.heartbeat_interval,
            },
            connection_tx,
        );

        let epoch = Arc::new(AtomicU64::new(0));
        let reconnection = ReconnectionManager::new(config.reconnection.clone());
        {
            let epoch = epoch.clone();
            reconnection
                .on_event(move |event| {
                    let _ = reconnection_tx.send((epoch.load(Ordering::SeqCst), event.clone()));
                })
                .detach();
        }

        let turn = TurnArbiter::new(config.user_starts_with_turn);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                base_url,
                credentials: RwLock::new(credentials),
                state: RwLock::new(ConnectionState::Disconnected),
                connection,
                reconnection,
                turn,
                dispatcher: EventDispatcher::new(),
                audio_output: Listeners::new(),
                lifecycle: Listeners::new(),
                stats: StatsCounters::default(),
                intentional_disconnect: AtomicBool::new(false),
                epoch,
                transition: ReentrantMutex::new(()),
                destroyed: AtomicBool::new(false),
                channels: Mutex::new(Some(EventChannels {
                    connection: connection_rx,
                    reconnection: reconnection_rx,
                })),
                event_loop: Mutex::new(None),
            }),
        })
    }

    /// Create a client over a WebSocket transport.
    pub fn with_websocket(config: RealtimeClientConfig) -> ClientResult<Self> {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    pub fn downgrade(&self) -> WeakRealtimeClient {
        WeakRealtimeClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles share the same session.
    pub fn ptr_eq(&self, other: &RealtimeClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn config(&self) -> &RealtimeClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.connection.is_open()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.credentials.read().session_id.clone()
    }

    pub fn has_auth_token(&self) -> bool {
        self.inner
            .credentials
            .read()
            .token
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.stats.snapshot()
    }

    pub fn turn(&self) -> &TurnArbiter {
        &self.inner.turn
    }

    /// Whether the user currently holds the turn.
    pub fn can_send_input(&self) -> bool {
        self.inner.turn.can_send_input()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnection.is_reconnecting()
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Listen for inbound events of one kind.
    pub fn on_event<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(kind, listener)
    }

    /// Listen for every dispatched inbound event.
    pub fn on_any_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe_any(listener)
    }

    /// Listen for agent audio. Payloads are raw PCM16 frames.
    pub fn on_audio_output<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.inner.audio_output.subscribe(listener)
    }

    pub fn on_lifecycle<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.inner.lifecycle.subscribe(listener)
    }

    pub fn on_turn_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TurnChange) + Send + Sync + 'static,
    {
        self.inner.turn.on_change(listener)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect to the backend.
    ///
    /// No-op when already connected. Rejected with
    /// [`ClientError::AlreadyConnecting`] while a connect or reconnection is in
    /// progress, and with [`ClientError::MissingAuthToken`] without a token.
    pub async fn connect(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(ClientError::ConnectionFailed("client destroyed".to_string()));
        }
        if !self.has_auth_token() {
            return Err(ClientError::MissingAuthToken);
        }

        inner.ensure_event_loop();

        let epoch = {
            let _transition = inner.transition.lock();
            let from = {
                let mut state = inner.state.write();
                match *state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {
                        return Err(ClientError::AlreadyConnecting);
                    }
                    ConnectionState::Disconnected => {}
                }
                std::mem::replace(&mut *state, ConnectionState::Connecting)
            };
            inner.announce_state(from, ConnectionState::Connecting);

            inner.intentional_disconnect.store(false, Ordering::SeqCst);
            inner.reconnection.reset();
            inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        let result = inner.open_connection(epoch).await;
        let Err(e) = result else {
            return Ok(());
        };

        let _transition = inner.transition.lock();
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            // disconnect() or a newer connect() owns the state now
            debug!("Superseded connect attempt ended: {}", e);
            return Err(e);
        }

        error!("Failed to connect: {}", e);
        let code = match e {
            ClientError::ConnectionTimeout(_) => CloseCode::CONNECT_TIMEOUT,
            _ => CloseCode::ABNORMAL,
        };
        if inner.set_state(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            inner.lifecycle.emit(&LifecycleEvent::Error(e.to_string()));
            inner.lifecycle.emit(&LifecycleEvent::Disconnected {
                code,
                reason: e.to_string(),
            });
        }
        Err(e)
    }

    /// Disconnect cleanly. Cancels a pending connect attempt and any pending
    /// reconnection; no further events fire for the torn-down connection.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let _transition = inner.transition.lock();
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.intentional_disconnect.store(true, Ordering::SeqCst);
        inner.reconnection.stop_reconnection();
        inner
            .connection
            .disconnect(CloseCode::NORMAL, "client disconnect");
        inner.turn.reset();

        if inner.set_state(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            info!("Disconnected from realtime backend");
            inner.lifecycle.emit(&LifecycleEvent::Disconnected {
                code: CloseCode::NORMAL,
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Swap the auth token and session id.
    ///
    /// An active session is disconnected and reconnected with the new
    /// credentials; the swap never happens under an open socket.
    pub async fn rotate_credentials(
        &self,
        token: impl Into<String>,
        session_id: Option<String>,
    ) -> ClientResult<()> {
        let was_active = self.state() != ConnectionState::Disconnected;
        if was_active {
            self.disconnect();
        }

        *self.inner.credentials.write() = Credentials {
            token: Some(token.into()),
            session_id,
        };
        info!("Credentials rotated");

        if was_active {
            self.connect().await
        } else {
            Ok(())
        }
    }

    /// Disconnect and drop every listener. Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        inner.dispatcher.clear();
        inner.audio_output.clear();
        inner.lifecycle.clear();
        inner.turn.clear_listeners();
        if let Some(handle) = inner.event_loop.lock().take() {
            handle.abort();
        }
        debug!("Realtime client destroyed");
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Send a JSON command.
    pub fn send_command(&self, command: &ClientCommand) -> ClientResult<()> {
        let json = command.to_json()?;
        self.inner.send_text(json)?;
        self.inner.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!(command = command.event_type(), "Command sent");
        Ok(())
    }

    /// Send a free-form command object. It must carry a string `type`.
    pub fn send_raw_command(&self, command: &serde_json::Value) -> ClientResult<()> {
        let json = raw_command_json(command)?;
        self.inner.send_text(json)?;
        self.inner.stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send raw PCM16 audio as a binary frame, with no envelope.
    pub fn send_binary_frame(&self, data: Bytes) -> ClientResult<()> {
        let len = data.len() as u64;
        self.inner.connection.send_binary(data)?;
        let stats = &self.inner.stats;
        stats.binary_frames_sent.fetch_add(1, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the agent to stop its current response.
    pub fn cancel_agent(&self) -> ClientResult<()> {
        self.send_command(&ClientCommand::ClientWantsCancel)
    }
}

impl ClientInner {
    fn ensure_event_loop(self: &Arc<Self>) {
        let Some(channels) = self.channels.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(run_event_loop(weak, channels));
        *self.event_loop.lock() = Some(handle);
    }

    /// Set the state, announcing it if it changed. Returns the previous state.
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        self.announce_state(previous, next);
        previous
    }

    fn announce_state(&self, from: ConnectionState, to: ConnectionState) {
        if from != to {
            debug!(%from, %to, "Connection state changed");
            self.lifecycle
                .emit(&LifecycleEvent::StateChanged { from, to });
        }
    }

    fn connection_url(&self) -> ClientResult<Url> {
        let credentials = self.credentials.read();
        let token = credentials
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ClientError::MissingAuthToken)?;
        build_connection_url(&self.base_url, token, credentials.session_id.as_deref())
            .map_err(|e| ClientError::InvalidConfiguration(e.to_string()))
    }

    /// Open the link and enter `Connected`, unless `epoch` was superseded
    /// while the attempt was in flight.
    async fn open_connection(&self, epoch: u64) -> ClientResult<()> {
        let url = self.connection_url()?;
        info!(url = %redact_url(&url), "Connecting to realtime backend");

        self.connection.connect(&url).await?;

        let _transition = self.transition.lock();
        let from = {
            let mut state = self.state.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(state);
                self.connection
                    .disconnect(CloseCode::NORMAL, "client disconnect");
                return Err(ClientError::ConnectionFailed(
                    "disconnected while connecting".to_string(),
                ));
            }
            std::mem::replace(&mut *state, ConnectionState::Connected)
        };

        self.stats.commands_sent.store(0, Ordering::Relaxed);
        self.announce_state(from, ConnectionState::Connected);
        info!("Connected to realtime backend");
        self.lifecycle.emit(&LifecycleEvent::Connected);
        Ok(())
    }

    fn send_text(&self, json: String) -> ClientResult<()> {
        let len = json.len() as u64;
        self.connection.send_text(json)?;
        self.stats.text_frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        if event.generation() != self.connection.generation() {
            debug!(
                generation = event.generation(),
                current = self.connection.generation(),
                "Dropping event from stale connection"
            );
            return;
        }

        match event {
            ConnectionEvent::Message {
                message: WireMessage::Binary(data),
                ..
            } => {
                self.stats.binary_frames_received.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_received
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.audio_output.emit(&data);
            }
            ConnectionEvent::Message {
                message: WireMessage::Text(text),
                ..
            } => {
                self.stats.text_frames_received.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_received
                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                self.handle_text(&text);
            }
            ConnectionEvent::Error { error, .. } => {
                warn!("Connection error: {}", error);
                self.lifecycle.emit(&LifecycleEvent::Error(error.to_string()));
            }
            ConnectionEvent::Closed { code, reason, .. } => self.handle_close(code, reason),
        }
    }

    fn handle_text(&self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping inbound message: {}", e);
                self.lifecycle.emit(&LifecycleEvent::Error(e.to_string()));
                return;
            }
        };

        match &event {
            ServerEvent::Ping => {
                if let Err(e) = ClientCommand::Pong
                    .to_json()
                    .and_then(|json| self.send_text(json))
                {
                    debug!("Failed to answer ping: {}", e);
                }
                return;
            }
            ServerEvent::Pong => {
                debug!("Heartbeat acknowledged");
                return;
            }
            ServerEvent::SessionStarted { session_id } => {
                let mut credentials = self.credentials.write();
                if credentials.session_id.is_none() {
                    info!(session_id = %session_id, "Session assigned by backend");
                    credentials.session_id = Some(session_id.clone());
                }
            }
            ServerEvent::Error { code, message } => {
                warn!(code = ?code, "Backend reported error: {}", message);
            }
            _ => {}
        }

        if let Some(signal) = event.turn_signal() {
            self.turn.apply(signal);
        }

        self.dispatcher.dispatch(&event);
    }

    fn handle_close(self: &Arc<Self>, code: CloseCode, reason: String) {
        let _transition = self.transition.lock();
        self.turn.reset();

        if self.intentional_disconnect.load(Ordering::SeqCst) || code.is_normal() {
            info!(%code, reason = %reason, "Connection closed");
            if self.set_state(ConnectionState::Disconnected) != ConnectionState::Disconnected {
                self.lifecycle
                    .emit(&LifecycleEvent::Disconnected { code, reason });
            }
            return;
        }

        error!(%code, reason = %reason, "Connection lost");

        if !self.reconnection.policy().enabled {
            self.set_state(ConnectionState::Disconnected);
            self.lifecycle
                .emit(&LifecycleEvent::Disconnected { code, reason });
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        self.reconnection.start_reconnection(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.open_connection(epoch).await,
                    None => Err(ClientError::ConnectionFailed("client dropped".to_string())),
                }
            }
        });
    }

    fn handle_reconnection_event(&self, epoch: u64, event: ReconnectionEvent) {
        let _transition = self.transition.lock();
        let state = *self.state.read();
        let current = epoch == self.epoch.load(Ordering::SeqCst)
            && !self.intentional_disconnect.load(Ordering::SeqCst)
            && match event {
                ReconnectionEvent::Reconnected { .. } => state == ConnectionState::Connected,
                _ => state == ConnectionState::Reconnecting,
            };
        if !current {
            debug!(event = ?event, %state, "Dropping reconnection event from a finished session");
            return;
        }

        match event {
            ReconnectionEvent::Reconnecting { attempt, delay } => {
                self.lifecycle
                    .emit(&LifecycleEvent::Reconnecting { attempt, delay });
            }
            ReconnectionEvent::Reconnected { attempts } => {
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                self.lifecycle
                    .emit(&LifecycleEvent::Reconnected { attempts });
            }
            ReconnectionEvent::ReconnectionFailed { reason } => {
                error!("Reconnection failed: {}", reason);
                self.set_state(ConnectionState::Disconnected);
                let error = ClientError::ReconnectionFailed(reason.clone());
                self.lifecycle.emit(&LifecycleEvent::Error(error.to_string()));
                self.lifecycle.emit(&LifecycleEvent::ReconnectionFailed {
                    reason: reason.clone(),
                });
                self.lifecycle.emit(&LifecycleEvent::Disconnected {
                    code: CloseCode::ABNORMAL,
                    reason,
                });
            }
        }
    }
}

/// Control-plane loop. Events are handled one at a time, in arrival order.
async fn run_event_loop(weak: Weak<ClientInner>, channels: EventChannels) {
    let EventChannels {
        connection: mut connection_rx,
        reconnection: mut reconnection_rx,
    } = channels;

    loop {
        tokio::select! {
            Some(event) = connection_rx.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_connection_event(event);
            }
            Some((epoch, event)) = reconnection_rx.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_reconnection_event(epoch, event);
            }
            else => break,
        }
    }

    debug!("Realtime event loop ended");
}
