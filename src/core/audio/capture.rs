//! Capture-side collaborator interface.
//!
//! A capture source produces fixed-format PCM16 chunks on its own thread or
//! task and hands them to subscribers. The client never performs capture
//! DSP itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use super::pcm::{duration_secs, rms_level, sample_count, samples_to_bytes};
use crate::core::events::{Listeners, Subscription};

/// One chunk of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// PCM16 LE mono samples.
    pub bytes: Bytes,
    pub sample_rate: u32,
    pub sample_count: usize,
    /// RMS level in [0, 1].
    pub level_rms: f32,
    /// Monotonically increasing per source.
    pub sequence: u64,
    pub captured_at_ms: u64,
}

impl AudioChunk {
    pub fn from_samples(samples: &[i16], sample_rate: u32, sequence: u64) -> Self {
        Self {
            bytes: samples_to_bytes(samples),
            sample_rate,
            sample_count: samples.len(),
            level_rms: rms_level(samples),
            sequence,
            captured_at_ms: now_ms(),
        }
    }

    /// Wrap an already-encoded PCM16 payload.
    pub fn from_bytes(bytes: Bytes, sample_rate: u32, sequence: u64) -> Self {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        Self {
            sample_count: sample_count(&bytes),
            level_rms: rms_level(&samples),
            bytes,
            sample_rate,
            sequence,
            captured_at_ms: now_ms(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(duration_secs(self.sample_count, self.sample_rate))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Callback invoked for every captured chunk.
pub type ChunkHandler = Box<dyn Fn(&AudioChunk) + Send + Sync>;

/// Producer of captured audio chunks.
pub trait AudioCaptureSource: Send + Sync {
    /// Register for chunks. Dropping the subscription unsubscribes.
    fn subscribe(&self, on_chunk: ChunkHandler) -> Subscription;

    /// Number of active subscribers.
    fn subscriber_count(&self) -> usize;
}

/// Fan-out capture source fed by [`BroadcastCaptureSource::publish`].
///
/// Publishing is safe from any thread; subscribers run on the publishing
/// thread.
#[derive(Clone, Default)]
pub struct BroadcastCaptureSource {
    listeners: Listeners<AudioChunk>,
    sequence: Arc<AtomicU64>,
}

impl BroadcastCaptureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a chunk to every subscriber.
    pub fn publish(&self, chunk: &AudioChunk) {
        self.listeners.emit(chunk);
    }

    /// Wrap `samples` in a chunk with the next sequence number and publish it.
    pub fn publish_samples(&self, samples: &[i16], sample_rate: u32) -> AudioChunk {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let chunk = AudioChunk::from_samples(samples, sample_rate, sequence);
        self.publish(&chunk);
        chunk
    }
}

impl AudioCaptureSource for BroadcastCaptureSource {
    fn subscribe(&self, on_chunk: ChunkHandler) -> Subscription {
        self.listeners.subscribe(on_chunk)
    }

    fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}
