//! Connection manager.
//!
//! Owns exactly one transport link at a time. Outbound frames are queued on
//! the link without blocking; inbound traffic is forwarded to the engine as
//! [`ConnectionEvent`]s tagged with the connection generation that produced
//! them.
//!
//! # Heartbeat
//!
//! When a heartbeat interval is configured, every tick sends an
//! application-level `{"type":"ping"}`. If no inbound traffic of any kind was
//! observed since the previous tick, the link is considered dead and is
//! force-closed with [`CloseCode::HEARTBEAT_TIMEOUT`]. The error reported
//! alongside is [`ClientError::PongTimeout`] when the previous ping went out
//! unanswered, and [`ClientError::PingTimeout`] when it could not be queued.
//!
//! # Teardown
//!
//! [`ConnectionManager::disconnect`] bumps the generation, cancels a connect
//! attempt that is still waiting on the transport, and stops the reader and
//! heartbeat tasks *before* writing the close frame, so no event from the old
//! link is ever delivered afterwards and no cancelled attempt can attach.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::error::{ClientError, ClientResult};
use crate::core::transport::{
    CloseCode, OutboundFrame, Transport, TransportEvent, TransportLink, WireMessage,
};

/// Application-level ping frame.
const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Connection-level settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Budget for a single connect attempt.
    pub connect_timeout: Duration,
    /// Heartbeat interval; `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Event forwarded from the link to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message {
        generation: u64,
        message: WireMessage,
    },
    Closed {
        generation: u64,
        code: CloseCode,
        reason: String,
    },
    Error {
        generation: u64,
        error: ClientError,
    },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ConnectionEvent::Message { generation, .. }
            | ConnectionEvent::Closed { generation, .. }
            | ConnectionEvent::Error { generation, .. } => *generation,
        }
    }
}

struct PendingConnect {
    generation: u64,
    cancel: CancellationToken,
}

struct ActiveLink {
    generation: u64,
    outbound: mpsc::Sender<OutboundFrame>,
    supports_binary: bool,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Owns the physical connection.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    active: Mutex<Option<ActiveLink>>,
    pending: Mutex<Option<PendingConnect>>,
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            active: Mutex::new(None),
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Generation of the current (or most recently torn down) link.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether the current link is open.
    pub fn is_open(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| link.open.load(Ordering::SeqCst))
    }

    /// Whether the current link carries binary frames.
    pub fn supports_binary(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|link| link.supports_binary)
    }

    /// Open a link to `url`, replacing any existing one.
    ///
    /// Resolves when the transport reports open. Fails with
    /// [`ClientError::ConnectionTimeout`] when the attempt exceeds the
    /// configured budget, and with [`ClientError::ConnectionFailed`] when
    /// [`disconnect`](Self::disconnect) or a newer `connect` supersedes it.
    pub async fn connect(&self, url: &Url) -> ClientResult<()> {
        self.disconnect(CloseCode::NORMAL, "replaced by new connection");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *self.pending.lock() = Some(PendingConnect {
            generation,
            cancel: cancel.clone(),
        });
        let budget = self.config.connect_timeout;

        debug!(generation, transport = self.transport.name(), "Opening connection");

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(budget, self.transport.open(url)) => Some(result),
        };
        self.clear_pending(generation);

        let link = match attempt {
            None => {
                debug!(generation, "Connect attempt cancelled");
                return Err(cancelled());
            }
            Some(Ok(Ok(link))) => link,
            Some(Ok(Err(e))) => return Err(e),
            Some(Err(_)) => {
                warn!(generation, timeout_ms = budget.as_millis() as u64, "Connect attempt timed out");
                return Err(ClientError::ConnectionTimeout(budget));
            }
        };

        self.attach(generation, link)?;
        info!(generation, "Connection open");
        Ok(())
    }

    fn clear_pending(&self, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.generation == generation) {
            *pending = None;
        }
    }

    fn attach(&self, generation: u64, link: TransportLink) -> ClientResult<()> {
        let TransportLink {
            outbound,
            mut inbound,
            supports_binary,
        } = link;

        if !supports_binary {
            warn!(generation, "Transport negotiated without binary frame support");
        }

        let open = Arc::new(AtomicBool::new(true));
        let traffic_seen = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let reader = {
            let events = self.events.clone();
            let open = open.clone();
            let traffic_seen = traffic_seen.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        event = inbound.recv() => event,
                    };

                    traffic_seen.store(true, Ordering::SeqCst);

                    match event {
                        Some(TransportEvent::Message(message)) => {
                            let _ = events.send(ConnectionEvent::Message {
                                generation,
                                message,
                            });
                        }
                        Some(TransportEvent::Error(error)) => {
                            let _ = events.send(ConnectionEvent::Error {
                                generation,
                                error: ClientError::ConnectionFailed(error),
                            });
                        }
                        Some(TransportEvent::Closed { code, reason }) => {
                            open.store(false, Ordering::SeqCst);
                            let _ = events.send(ConnectionEvent::Closed {
                                generation,
                                code,
                                reason,
                            });
                            break;
                        }
                        None => {
                            open.store(false, Ordering::SeqCst);
                            let _ = events.send(ConnectionEvent::Closed {
                                generation,
                                code: CloseCode::ABNORMAL,
                                reason: "transport ended".to_string(),
                            });
                            break;
                        }
                    }
                }
            })
        };

        let heartbeat = self.config.heartbeat_interval.map(|interval| {
            let events = self.events.clone();
            let outbound = outbound.clone();
            let open = open.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // First tick completes immediately
                ticker.tick().await;
                let mut ping_queued = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    if !open.load(Ordering::SeqCst) {
                        break;
                    }

                    if !traffic_seen.swap(false, Ordering::SeqCst) {
                        let (error, reason) = if ping_queued {
                            (ClientError::PongTimeout, "pong timeout")
                        } else {
                            (ClientError::PingTimeout, "ping timeout")
                        };
                        warn!(generation, reason, "No traffic since last heartbeat, closing connection");
                        open.store(false, Ordering::SeqCst);
                        cancel.cancel();
                        let _ = outbound.try_send(OutboundFrame::Close {
                            code: CloseCode::HEARTBEAT_TIMEOUT,
                            reason: reason.to_string(),
                        });
                        let _ = events.send(ConnectionEvent::Error { generation, error });
                        let _ = events.send(ConnectionEvent::Closed {
                            generation,
                            code: CloseCode::HEARTBEAT_TIMEOUT,
                            reason: reason.to_string(),
                        });
                        break;
                    }

                    ping_queued = match outbound.try_send(OutboundFrame::Message(
                        WireMessage::Text(PING_FRAME.to_string()),
                    )) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(generation, "Failed to queue heartbeat ping: {}", e);
                            false
                        }
                    };
                }
            })
        });

        let mut active = self.active.lock();
        if self.generation() != generation {
            // Superseded between open and attach
            drop(active);
            cancel.cancel();
            reader.abort();
            if let Some(heartbeat) = heartbeat {
                heartbeat.abort();
            }
            let _ = outbound.try_send(OutboundFrame::Close {
                code: CloseCode::NORMAL,
                reason: "connect cancelled".to_string(),
            });
            return Err(cancelled());
        }

        *active = Some(ActiveLink {
            generation,
            outbound,
            supports_binary,
            open,
            cancel,
            reader,
            heartbeat,
        });
        Ok(())
    }

    /// Queue a frame on the open link.
    pub fn send(&self, message: WireMessage) -> ClientResult<()> {
        let guard = self.active.lock();
        let link = guard
            .as_ref()
            .filter(|link| link.open.load(Ordering::SeqCst))
            .ok_or(ClientError::NotConnected)?;

        if message.is_binary() && !link.supports_binary {
            return Err(ClientError::BinaryUnsupported);
        }

        link.outbound
            .try_send(OutboundFrame::Message(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ClientError::SendFailed("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => ClientError::NotConnected,
            })
    }

    pub fn send_text(&self, text: impl Into<String>) -> ClientResult<()> {
        self.send(WireMessage::Text(text.into()))
    }

    pub fn send_binary(&self, data: Bytes) -> ClientResult<()> {
        self.send(WireMessage::Binary(data))
    }

    /// Tear down the current link and cancel any pending connect attempt.
    /// Idempotent.
    ///
    /// Reader and heartbeat are detached before the close frame is written.
    pub fn disconnect(&self, code: CloseCode, reason: &str) {
        // Anything still in flight is now stale, attached or not
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(pending) = self.pending.lock().take() {
            pending.cancel.cancel();
            debug!(generation = pending.generation, "Pending connect cancelled");
        }

        let Some(link) = self.active.lock().take() else {
            return;
        };

        link.cancel.cancel();
        link.reader.abort();
        if let Some(heartbeat) = link.heartbeat {
            heartbeat.abort();
        }

        if link.open.swap(false, Ordering::SeqCst) {
            let _ = link.outbound.try_send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }

        debug!(generation = link.generation, %code, reason, "Connection torn down");
    }
}

fn cancelled() -> ClientError {
    ClientError::ConnectionFailed("connect cancelled by disconnect".to_string())
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect(CloseCode::GOING_AWAY, "client dropped");
    }
}
