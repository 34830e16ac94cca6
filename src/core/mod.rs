pub mod audio;
pub mod connection;
pub mod error;
pub mod events;
pub mod realtime;
pub mod reconnection;
pub mod transport;
pub mod turn;

// Re-export commonly used types for convenience
pub use audio::{
    AudioCaptureSource, AudioChunk, AudioEgressScheduler, AudioIngressBridge, AudioSink,
    BroadcastCaptureSource, EgressConfig, EgressStatus, IngressStatus, VoiceMode,
    WavCaptureSource, WavRenderSink,
};

pub use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};

pub use error::{AudioError, AudioResult, ClientError, ClientResult};

pub use events::{Listeners, Subscription};

pub use realtime::{
    ClientCommand, ClientStats, ConnectionState, EventKind, LifecycleEvent, RealtimeClient,
    RealtimeClientConfig, ServerEvent, TranscriptRole, WeakRealtimeClient,
};

pub use reconnection::{ReconnectionEvent, ReconnectionManager, ReconnectionPolicy};

pub use transport::{
    CloseCode, MemoryPeer, MemoryTransport, OutboundFrame, Transport, TransportEvent,
    TransportLink, WebSocketTransport, WireMessage,
};

pub use turn::{TurnArbiter, TurnChange, TurnHolder, TurnSignal};
