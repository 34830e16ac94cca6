//! Transport capability.
//!
//! The client never touches a concrete socket API directly. A [`Transport`]
//! opens a [`TransportLink`]: a pair of channels carrying outbound frames and
//! inbound events, plus the negotiated capabilities of the link.
//!
//! # Implementations
//!
//! - [`WebSocketTransport`] - tokio-tungstenite over `ws://` / `wss://`
//! - [`MemoryTransport`] - in-process loopback, driven by a [`MemoryPeer`]

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use url::Url;

use crate::core::error::ClientResult;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Capacity of the per-link channels.
pub const LINK_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Frames
// =============================================================================

/// A single message on the wire.
///
/// Text payloads carry JSON control events; binary payloads carry raw PCM16
/// audio with no envelope. The two are never mixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn is_binary(&self) -> bool {
        matches!(self, WireMessage::Binary(_))
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// WebSocket-style close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Clean, user-initiated shutdown.
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Peer is going away (server shutdown, page navigation).
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// The link dropped without a close frame.
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    /// No traffic was observed between two heartbeat ticks.
    pub const HEARTBEAT_TIMEOUT: CloseCode = CloseCode(4000);
    /// The connect attempt exceeded its budget.
    pub const CONNECT_TIMEOUT: CloseCode = CloseCode(4008);

    /// Only [`CloseCode::NORMAL`] counts as a clean shutdown.
    pub fn is_normal(self) -> bool {
        self == CloseCode::NORMAL
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame queued by the client for the transport to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Message(WireMessage),
    Close { code: CloseCode, reason: String },
}

/// Event produced by the transport for the client to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(WireMessage),
    Closed { code: CloseCode, reason: String },
    Error(String),
}

// =============================================================================
// Transport trait
// =============================================================================

/// An open link to the backend.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames written by the client.
    pub outbound: mpsc::Sender<OutboundFrame>,
    /// Messages and close notifications read from the socket.
    pub inbound: mpsc::Receiver<TransportEvent>,
    /// Whether the link carries raw binary frames.
    pub supports_binary: bool,
}

/// Opens links to the backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link. Resolves once the socket reports open, or fails.
    async fn open(&self, url: &Url) -> ClientResult<TransportLink>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
