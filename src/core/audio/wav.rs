//! WAV file collaborators.
//!
//! [`WavCaptureSource`] replays a 16-bit mono WAV file as real-time paced
//! capture chunks. [`WavRenderSink`] is an offline playback device: it
//! records scheduled buffers on a wall clock and mixes them into a WAV file.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::capture::{AudioCaptureSource, BroadcastCaptureSource, ChunkHandler};
use super::egress::{AudioSink, SourceId};
use super::pcm::encode_pcm16;
use crate::core::error::{AudioError, AudioResult};
use crate::core::events::Subscription;

fn pcm16_mono_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

// =============================================================================
// Capture
// =============================================================================

/// Capture source backed by a WAV file.
pub struct WavCaptureSource {
    chunks: Arc<Vec<Vec<i16>>>,
    sample_rate: u32,
    chunk_duration: Duration,
    broadcast: BroadcastCaptureSource,
}

impl WavCaptureSource {
    /// Load `path` and split it into `chunk_ms` chunks.
    ///
    /// Only 16-bit integer mono files are accepted.
    pub fn open(path: impl AsRef<Path>, chunk_ms: u32) -> AudioResult<Self> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(AudioError::InvalidFormat(format!(
                "expected 16-bit mono PCM, got {} channel(s) at {} bits",
                spec.channels, spec.bits_per_sample
            )));
        }

        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            path = %path.as_ref().display(),
            sample_rate = spec.sample_rate,
            samples = samples.len(),
            "Loaded WAV capture source"
        );
        Self::from_samples(samples, spec.sample_rate, chunk_ms)
    }

    pub fn from_samples(samples: Vec<i16>, sample_rate: u32, chunk_ms: u32) -> AudioResult<Self> {
        if sample_rate == 0 || chunk_ms == 0 {
            return Err(AudioError::InvalidFormat(
                "sample rate and chunk length must be non-zero".to_string(),
            ));
        }

        let chunk_len = ((sample_rate as u64 * chunk_ms as u64) / 1000).max(1) as usize;
        let chunks = samples.chunks(chunk_len).map(<[i16]>::to_vec).collect();

        Ok(Self {
            chunks: Arc::new(chunks),
            sample_rate,
            chunk_duration: Duration::from_millis(chunk_ms as u64),
            broadcast: BroadcastCaptureSource::new(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Publish every chunk, one per chunk period. Resolves to the number of
    /// chunks published.
    pub fn start(&self) -> JoinHandle<usize> {
        let chunks = self.chunks.clone();
        let broadcast = self.broadcast.clone();
        let sample_rate = self.sample_rate;
        let period = self.chunk_duration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut published = 0;
            for chunk in chunks.iter() {
                ticker.tick().await;
                broadcast.publish_samples(chunk, sample_rate);
                published += 1;
            }
            debug!(published, "WAV capture finished");
            published
        })
    }
}

impl AudioCaptureSource for WavCaptureSource {
    fn subscribe(&self, on_chunk: ChunkHandler) -> Subscription {
        self.broadcast.subscribe(on_chunk)
    }

    fn subscriber_count(&self) -> usize {
        self.broadcast.subscriber_count()
    }
}

// =============================================================================
// Render sink
// =============================================================================

struct RenderedSource {
    id: SourceId,
    start_at: f64,
    samples: Vec<f32>,
    gain: f32,
    stopped_at: Option<f64>,
}

/// Offline playback device that mixes scheduled buffers into a timeline.
pub struct WavRenderSink {
    sample_rate: u32,
    started: Instant,
    sources: Mutex<Vec<RenderedSource>>,
}

impl WavRenderSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            started: Instant::now(),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Mix every scheduled buffer into one timeline starting at clock zero.
    ///
    /// A stopped buffer contributes only the part before its stop time.
    pub fn render(&self) -> Vec<f32> {
        let rate = self.sample_rate as f64;
        let sources = self.sources.lock();

        let spans: Vec<(usize, usize, &RenderedSource)> = sources
            .iter()
            .map(|source| {
                let offset = (source.start_at * rate).round().max(0.0) as usize;
                let audible = match source.stopped_at {
                    Some(stopped) => {
                        (((stopped - source.start_at) * rate).round().max(0.0) as usize)
                            .min(source.samples.len())
                    }
                    None => source.samples.len(),
                };
                (offset, audible, source)
            })
            .collect();

        let length = spans
            .iter()
            .map(|(offset, audible, _)| offset + audible)
            .max()
            .unwrap_or(0);

        let mut timeline = vec![0.0f32; length];
        for (offset, audible, source) in spans {
            for (i, sample) in source.samples[..audible].iter().enumerate() {
                timeline[offset + i] += sample * source.gain;
            }
        }
        timeline
    }

    /// Write the mixed timeline to `path`. Returns the number of samples.
    pub fn finish(&self, path: impl AsRef<Path>) -> AudioResult<usize> {
        let timeline = self.render();
        let mut writer = hound::WavWriter::create(path.as_ref(), pcm16_mono_spec(self.sample_rate))?;
        for pair in encode_pcm16(&timeline).chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;

        info!(
            path = %path.as_ref().display(),
            samples = timeline.len(),
            "Wrote rendered agent audio"
        );
        Ok(timeline.len())
    }
}

impl AudioSink for WavRenderSink {
    fn current_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
        gain: f32,
    ) -> AudioResult<SourceId> {
        if sample_rate != self.sample_rate {
            return Err(AudioError::InvalidFormat(format!(
                "sink runs at {} Hz, buffer is {} Hz",
                self.sample_rate, sample_rate
            )));
        }

        let mut sources = self.sources.lock();
        let id = sources.len() as SourceId + 1;
        sources.push(RenderedSource {
            id,
            start_at,
            samples,
            gain,
            stopped_at: None,
        });
        Ok(id)
    }

    fn stop(&self, source: SourceId) {
        let now = self.current_time();
        if let Some(entry) = self.sources.lock().iter_mut().find(|s| s.id == source) {
            entry.stopped_at.get_or_insert(now);
        }
    }
}
