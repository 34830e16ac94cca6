//! Audio plumbing around the realtime engine.
//!
//! Capture flows through [`AudioIngressBridge`] into the engine as binary
//! frames while the user holds the turn. Agent audio flows out of the engine
//! into [`AudioEgressScheduler`], which lays PCM buffers end to end on an
//! [`AudioSink`] clock.

pub mod capture;
pub mod egress;
pub mod ingress;
pub mod pcm;
pub mod wav;

pub use capture::{AudioCaptureSource, AudioChunk, BroadcastCaptureSource, ChunkHandler};
pub use egress::{
    AudioEgressScheduler, AudioSink, DEFAULT_SCHEDULE_AHEAD_SECONDS, EgressConfig, EgressStatus,
    PLAYBACK_OVERLAP_SECONDS, SourceId, VoiceMode,
};
pub use ingress::{AudioIngressBridge, IngressStatus};
pub use pcm::{decode_pcm16, encode_pcm16, rms_level};
pub use wav::{WavCaptureSource, WavRenderSink};
