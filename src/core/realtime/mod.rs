//! Realtime conversation protocol.
//!
//! Hybrid wire format over one socket: JSON text frames for control events,
//! raw binary frames for PCM16 audio.

pub mod client;
pub mod dispatch;
pub mod messages;

pub use client::{
    ClientStats, ConnectionState, LifecycleEvent, RealtimeClient, RealtimeClientConfig,
    WeakRealtimeClient,
};
pub use dispatch::EventDispatcher;
pub use messages::{ClientCommand, EventKind, ServerEvent, TranscriptRole};
