//! Audio egress: gapless scheduling of agent speech.
//!
//! Frames are decoded and scheduled strictly in arrival order against the
//! sink's clock:
//!
//! ```text
//! start_at   = max(now, next_start)
//! next_start = start_at + duration - overlap
//! ```
//!
//! The small negative overlap masks rounding gaps at chunk boundaries. The
//! cursor starts at the clock's current time and is reset by
//! [`AudioEgressScheduler::stop_playback`] and by any voice-mode change into
//! or out of a skip mode.
//!
//! # Backlog
//!
//! Frames are handed to the sink only while the cursor is within
//! `schedule_ahead_seconds` of the sink clock. Anything further out stays in
//! the queue, where [`AudioEgressScheduler::clear_buffers`] can still drop it.
//! Inside a tokio runtime a pump task drains the backlog as the clock
//! catches up; elsewhere [`AudioEgressScheduler::pump`] does it on demand.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::pcm::{decode_pcm16, duration_secs};
use crate::core::error::AudioResult;
use crate::core::events::Subscription;
use crate::core::realtime::RealtimeClient;

/// Overlap subtracted between consecutive frames, in seconds.
pub const PLAYBACK_OVERLAP_SECONDS: f64 = 0.02;

/// How far past the sink clock frames are scheduled by default, in seconds.
pub const DEFAULT_SCHEDULE_AHEAD_SECONDS: f64 = 2.0;

/// Shortest sleep of the backlog pump.
const MIN_PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Identifier of a scheduled buffer inside a sink.
pub type SourceId = u64;

/// Playback device capability.
pub trait AudioSink: Send + Sync {
    /// Monotonic playback clock, in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `samples` to start at `start_at` on the sink clock.
    ///
    /// Must return as soon as the buffer is time-stamped.
    fn schedule(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
        gain: f32,
    ) -> AudioResult<SourceId>;

    /// Halt a scheduled or playing buffer.
    fn stop(&self, source: SourceId);
}

/// How agent audio is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// Play through the local sink.
    #[default]
    Normal,
    /// An external avatar renderer plays the audio.
    AvatarRendered,
    /// Audio is suppressed.
    TextOnly,
}

impl VoiceMode {
    /// Whether audio is discarded in this mode.
    pub fn skips_playback(self) -> bool {
        !matches!(self, VoiceMode::Normal)
    }
}

impl fmt::Display for VoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceMode::Normal => write!(f, "normal"),
            VoiceMode::AvatarRendered => write!(f, "avatar_rendered"),
            VoiceMode::TextOnly => write!(f, "text_only"),
        }
    }
}

impl FromStr for VoiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(VoiceMode::Normal),
            "avatar_rendered" | "avatar" => Ok(VoiceMode::AvatarRendered),
            "text_only" | "text" => Ok(VoiceMode::TextOnly),
            other => Err(format!("unknown voice mode: {other}")),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EgressConfig {
    /// Sample rate of incoming agent audio.
    pub sample_rate: u32,
    pub overlap_seconds: f64,
    /// Scheduling horizon past the sink clock; `None` schedules every frame
    /// on arrival.
    pub schedule_ahead_seconds: Option<f64>,
    pub voice_mode: VoiceMode,
    pub volume: f32,
    pub enabled: bool,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            overlap_seconds: PLAYBACK_OVERLAP_SECONDS,
            schedule_ahead_seconds: Some(DEFAULT_SCHEDULE_AHEAD_SECONDS),
            voice_mode: VoiceMode::Normal,
            volume: 1.0,
            enabled: true,
        }
    }
}

/// Snapshot of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EgressStatus {
    pub is_playing: bool,
    pub enabled: bool,
    pub received: u64,
    pub played: u64,
    pub skipped: u64,
    pub queue_length: usize,
    pub volume: f32,
    pub voice_mode: VoiceMode,
}

struct ActiveSource {
    id: SourceId,
    ends_at: f64,
}

struct EgressState {
    queue: VecDeque<Bytes>,
    next_start: Option<f64>,
    active: Vec<ActiveSource>,
    enabled: bool,
    volume: f32,
    voice_mode: VoiceMode,
    received: u64,
    played: u64,
    skipped: u64,
    pump_running: bool,
}

impl EgressState {
    fn should_skip(&self) -> bool {
        !self.enabled || self.voice_mode.skips_playback()
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.next_start = None;
    }
}

struct EgressInner {
    sink: Arc<dyn AudioSink>,
    sample_rate: u32,
    overlap_seconds: f64,
    schedule_ahead: Option<f64>,
    state: Mutex<EgressState>,
}

/// Queues agent audio and schedules it back to back on an [`AudioSink`].
#[derive(Clone)]
pub struct AudioEgressScheduler {
    inner: Arc<EgressInner>,
}

impl AudioEgressScheduler {
    pub fn new(sink: Arc<dyn AudioSink>, config: EgressConfig) -> Self {
        Self {
            inner: Arc::new(EgressInner {
                sink,
                sample_rate: config.sample_rate,
                overlap_seconds: config.overlap_seconds,
                schedule_ahead: config
                    .schedule_ahead_seconds
                    .filter(|s| s.is_finite() && *s >= 0.0),
                state: Mutex::new(EgressState {
                    queue: VecDeque::new(),
                    next_start: None,
                    active: Vec::new(),
                    enabled: config.enabled,
                    volume: config.volume.clamp(0.0, 1.0),
                    voice_mode: config.voice_mode,
                    received: 0,
                    played: 0,
                    skipped: 0,
                    pump_running: false,
                }),
            }),
        }
    }

    /// Feed agent audio from `client` into this scheduler.
    pub fn bind(&self, client: &RealtimeClient) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        client.on_audio_output(move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue(frame.clone());
            }
        })
    }

    /// Queue one binary frame and schedule whatever fits in the horizon.
    pub fn enqueue(&self, frame: Bytes) {
        Arc::clone(&self.inner).enqueue(frame);
    }

    /// Schedule queued frames that the sink clock has caught up with.
    pub fn pump(&self) {
        let mut state = self.inner.state.lock();
        self.inner.drain(&mut state);
    }

    pub fn should_skip_playback(&self) -> bool {
        self.inner.state.lock().should_skip()
    }

    /// Halt active playback and drop the queue and cursor. Idempotent.
    pub fn stop_playback(&self) {
        let active: Vec<ActiveSource> = {
            let mut state = self.inner.state.lock();
            state.flush();
            state.active.drain(..).collect()
        };
        if !active.is_empty() {
            debug!(sources = active.len(), "Stopping playback");
        }
        for source in active {
            self.inner.sink.stop(source.id);
        }
    }

    /// Drop queued frames only. Scheduled sources keep playing and the
    /// cursor stays put, so the next frame follows them.
    pub fn clear_buffers(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!(frames = dropped, "Cleared queued agent audio");
        }
    }

    pub fn set_voice_mode(&self, mode: VoiceMode) {
        let mut state = self.inner.state.lock();
        let previous = state.voice_mode;
        if previous == mode {
            return;
        }
        if previous.skips_playback() || mode.skips_playback() {
            state.flush();
        }
        state.voice_mode = mode;
        debug!(from = %previous, to = %mode, "Voice mode changed");
    }

    pub fn voice_mode(&self) -> VoiceMode {
        self.inner.state.lock().voice_mode
    }

    /// Set the output gain, clamped to [0, 1]. NaN is ignored.
    pub fn set_volume(&self, volume: f32) {
        if volume.is_nan() {
            return;
        }
        self.inner.state.lock().volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        state.flush();
    }

    pub fn is_playing(&self) -> bool {
        let now = self.inner.sink.current_time();
        self.inner
            .state
            .lock()
            .active
            .iter()
            .any(|s| s.ends_at > now)
    }

    pub fn status(&self) -> EgressStatus {
        let is_playing = self.is_playing();
        let state = self.inner.state.lock();
        EgressStatus {
            is_playing,
            enabled: state.enabled,
            received: state.received,
            played: state.played,
            skipped: state.skipped,
            queue_length: state.queue.len(),
            volume: state.volume,
            voice_mode: state.voice_mode,
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.inner.state.lock();
        state.received = 0;
        state.played = 0;
        state.skipped = 0;
    }
}

impl EgressInner {
    fn enqueue(self: Arc<Self>, frame: Bytes) {
        let mut state = self.state.lock();
        state.received += 1;

        if state.should_skip() {
            state.skipped += 1;
            trace!(bytes = frame.len(), mode = %state.voice_mode, "Skipping agent audio");
            return;
        }

        state.queue.push_back(frame);
        if self.drain(&mut state) && !state.pump_running {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                state.pump_running = true;
                runtime.spawn(run_pump(Arc::downgrade(&self)));
            }
        }
    }

    /// Schedule queued frames in order until one falls past the horizon.
    /// Returns whether a backlog remains.
    fn drain(&self, state: &mut EgressState) -> bool {
        while !state.queue.is_empty() {
            if self.wait_for_horizon(state).is_some() {
                return true;
            }
            if let Some(frame) = state.queue.pop_front() {
                self.schedule_frame(state, &frame);
            }
        }
        false
    }

    /// Time until the cursor enters the horizon, if it is beyond it.
    fn wait_for_horizon(&self, state: &EgressState) -> Option<Duration> {
        let ahead = self.schedule_ahead?;
        let next = state.next_start?;
        let wait = next - (self.sink.current_time() + ahead);
        (wait > 0.0).then(|| Duration::from_secs_f64(wait))
    }

    fn schedule_frame(&self, state: &mut EgressState, frame: &[u8]) {
        let samples = decode_pcm16(frame);
        if samples.is_empty() {
            debug!("Ignoring empty audio frame");
            return;
        }

        let now = self.sink.current_time();
        state.active.retain(|s| s.ends_at > now);

        let start_at = state.next_start.map_or(now, |next| next.max(now));
        let duration = duration_secs(samples.len(), self.sample_rate);

        match self
            .sink
            .schedule(samples, self.sample_rate, start_at, state.volume)
        {
            Ok(id) => {
                state.active.push(ActiveSource {
                    id,
                    ends_at: start_at + duration,
                });
                state.played += 1;
                state.next_start = Some((start_at + duration - self.overlap_seconds).max(start_at));
                trace!(start_at, duration, "Scheduled agent audio");
            }
            Err(e) => warn!("Failed to schedule agent audio: {}", e),
        }
    }
}

/// Drains the backlog as the sink clock advances. Exits once the queue is
/// empty or the scheduler is gone.
async fn run_pump(weak: Weak<EgressInner>) {
    loop {
        let wait = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if !inner.drain(&mut state) {
                state.pump_running = false;
                return;
            }
            inner
                .wait_for_horizon(&state)
                .unwrap_or(MIN_PUMP_INTERVAL)
                .max(MIN_PUMP_INTERVAL)
        };
        tokio::time::sleep(wait).await;
    }
}
