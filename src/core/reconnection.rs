//! Reconnection policy and scheduler.
//!
//! [`ReconnectionManager`] drives a single backoff loop at a time. Each
//! attempt is announced with [`ReconnectionEvent::Reconnecting`] before its
//! delay starts. A successful attempt ends the loop with
//! [`ReconnectionEvent::Reconnected`]; exhausting the budget ends it with
//! exactly one [`ReconnectionEvent::ReconnectionFailed`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::ClientResult;
use crate::core::events::{Listeners, Subscription};

/// Configuration for automatic reconnection behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Enable automatic reconnection on connection loss.
    /// Default: true
    pub enabled: bool,

    /// Number of attempts before giving up. Zero means no attempts are made.
    /// Default: 5
    pub max_attempts: u32,

    /// Initial delay between reconnection attempts (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnection attempts (milliseconds).
    /// Default: 30000ms (30 seconds)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add up to 25% jitter to each delay.
    /// Default: true
    pub jitter: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Create a policy with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before the given attempt (1-based), in milliseconds.
    ///
    /// `initial_delay_ms * backoff_multiplier^(attempt-1)`, capped at
    /// `max_delay_ms`.
    pub fn calculate_delay(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jitter = rand_jitter(delay * 0.25);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        }
    }

    /// Check if another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

/// Pseudo-random value in `[-range, range]` from a time-seeded LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64;
    (normalized - 0.5) * 2.0 * range
}

/// Progress of a reconnection loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionEvent {
    /// Attempt `attempt` (1-based) will run after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The link is back after `attempts` attempts.
    Reconnected { attempts: u32 },
    /// The attempt budget is exhausted. Emitted once per loop.
    ReconnectionFailed { reason: String },
}

struct ActiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Schedules reconnect attempts with exponential backoff.
pub struct ReconnectionManager {
    policy: ReconnectionPolicy,
    attempts: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
    active: Mutex<Option<ActiveLoop>>,
    listeners: Listeners<ReconnectionEvent>,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            attempts: Arc::new(AtomicU32::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(None),
            listeners: Listeners::new(),
        }
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// Failed attempts in the current loop.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ReconnectionEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Start the backoff loop. `attempt` is invoked once per attempt.
    ///
    /// A disabled policy reports failure immediately. Calling this while a
    /// loop is already running is a no-op.
    pub fn start_reconnection<F, Fut>(&self, attempt: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ClientResult<()>> + Send + 'static,
    {
        if !self.policy.enabled {
            debug!("Reconnection disabled");
            self.listeners.emit(&ReconnectionEvent::ReconnectionFailed {
                reason: "reconnection disabled".to_string(),
            });
            return;
        }

        let mut active = self.active.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Reconnection already in progress");
            return;
        }

        let cancel = CancellationToken::new();
        let policy = self.policy.clone();
        let attempts = self.attempts.clone();
        let running = self.running.clone();
        let listeners = self.listeners.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut last_error: Option<String> = None;

            loop {
                let failed = attempts.load(Ordering::SeqCst);
                if !policy.should_retry(failed) {
                    let reason = match &last_error {
                        Some(e) => format!("gave up after {failed} attempts: {e}"),
                        None => format!("gave up after {failed} attempts"),
                    };
                    warn!("{}", reason);
                    running.store(false, Ordering::SeqCst);
                    listeners.emit(&ReconnectionEvent::ReconnectionFailed { reason });
                    return;
                }

                let attempt_number = failed + 1;
                let delay = Duration::from_millis(policy.calculate_delay(attempt_number));
                info!(
                    attempt = attempt_number,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection attempt"
                );
                listeners.emit(&ReconnectionEvent::Reconnecting {
                    attempt: attempt_number,
                    delay,
                });

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = attempt() => result,
                };

                match result {
                    Ok(()) => {
                        let made = attempts.swap(0, Ordering::SeqCst) + 1;
                        info!(attempts = made, "Reconnected");
                        running.store(false, Ordering::SeqCst);
                        listeners.emit(&ReconnectionEvent::Reconnected { attempts: made });
                        return;
                    }
                    Err(e) => {
                        warn!(attempt = attempt_number, "Reconnection attempt failed: {}", e);
                        attempts.fetch_add(1, Ordering::SeqCst);
                        last_error = Some(e.to_string());
                    }
                }
            }
        });

        *active = Some(ActiveLoop { cancel, handle });
    }

    /// Cancel any pending attempt. Safe to call at any time.
    pub fn stop_reconnection(&self) {
        if let Some(active) = self.active.lock().take() {
            active.cancel.cancel();
            active.handle.abort();
        }
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Reconnection stopped");
        }
    }

    /// Clear the attempt counter without touching an in-flight timer.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.stop_reconnection();
    }
}
