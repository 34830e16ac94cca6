//! Audio ingress: capture chunks to binary frames, gated by turn state.
//!
//! The bridge keeps a cached copy of the engine's connection and turn state,
//! refreshed by subscription callbacks, so the per-chunk decision is a pair
//! of atomic loads:
//!
//! ```text
//! should_send = !respect_turn_state || (connected && user_has_turn)
//! ```
//!
//! Chunks that fail the gate are dropped, never buffered. A chunk captured
//! just before a turn-ending signal arrives may still be sent; the gate only
//! sees signals the engine has already processed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::capture::{AudioCaptureSource, AudioChunk};
use crate::core::error::{ClientError, ClientResult};
use crate::core::events::Subscription;
use crate::core::realtime::{ConnectionState, LifecycleEvent, RealtimeClient, WeakRealtimeClient};

/// Snapshot of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngressStatus {
    pub is_streaming: bool,
    pub is_connected: bool,
    pub user_has_turn: bool,
    pub respect_turn_state: bool,
    pub streamed: u64,
    pub suppressed: u64,
    /// Chunks that passed the gate but failed to send. Also counted in
    /// `streamed`.
    pub send_errors: u64,
}

struct Binding {
    client: WeakRealtimeClient,
    _turn: Subscription,
    _lifecycle: Subscription,
}

struct BridgeInner {
    capture: Arc<dyn AudioCaptureSource>,
    respect_turn_state: AtomicBool,
    binding: Mutex<Option<Binding>>,
    capture_subscription: Mutex<Option<Subscription>>,
    streaming: AtomicBool,
    connected: AtomicBool,
    user_has_turn: AtomicBool,
    streamed: AtomicU64,
    suppressed: AtomicU64,
    send_errors: AtomicU64,
}

/// Forwards captured audio to a [`RealtimeClient`] while the user holds the
/// turn.
#[derive(Clone)]
pub struct AudioIngressBridge {
    inner: Arc<BridgeInner>,
}

impl AudioIngressBridge {
    pub fn new(capture: Arc<dyn AudioCaptureSource>, respect_turn_state: bool) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                capture,
                respect_turn_state: AtomicBool::new(respect_turn_state),
                binding: Mutex::new(None),
                capture_subscription: Mutex::new(None),
                streaming: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                user_has_turn: AtomicBool::new(false),
                streamed: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                send_errors: AtomicU64::new(0),
            }),
        }
    }

    /// Bind to `client`, or unbind with `None`.
    ///
    /// The previous client's subscriptions are dropped before the new ones
    /// are made. Rebinding the same client is a no-op. Unbinding stops
    /// streaming.
    pub fn set_client(&self, client: Option<&RealtimeClient>) {
        let inner = &self.inner;
        let mut binding = inner.binding.lock();

        if let (Some(current), Some(next)) = (binding.as_ref(), client) {
            if current.client.is(next) {
                return;
            }
        }

        // Old subscriptions go first
        binding.take();

        let Some(client) = client else {
            inner.connected.store(false, Ordering::SeqCst);
            inner.user_has_turn.store(false, Ordering::SeqCst);
            drop(binding);
            self.stop_streaming();
            debug!("Ingress bridge unbound");
            return;
        };

        let weak: Weak<BridgeInner> = Arc::downgrade(inner);

        let turn = client.on_turn_change({
            let weak = weak.clone();
            move |change| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .user_has_turn
                        .store(change.can_send_input, Ordering::SeqCst);
                }
            }
        });

        let lifecycle = client.on_lifecycle({
            let weak = weak.clone();
            let engine = client.downgrade();
            move |event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    LifecycleEvent::StateChanged { to, .. } => {
                        inner
                            .connected
                            .store(*to == ConnectionState::Connected, Ordering::SeqCst);
                    }
                    LifecycleEvent::Connected | LifecycleEvent::Reconnected { .. } => {
                        let connected = engine.upgrade().is_some_and(|c| c.is_connected());
                        inner.connected.store(connected, Ordering::SeqCst);
                    }
                    LifecycleEvent::Disconnected { .. } => {
                        inner.connected.store(false, Ordering::SeqCst);
                        inner.stop_streaming();
                    }
                    _ => {}
                }
            }
        });

        inner
            .user_has_turn
            .store(client.can_send_input(), Ordering::SeqCst);
        inner
            .connected
            .store(client.is_connected(), Ordering::SeqCst);

        *binding = Some(Binding {
            client: client.downgrade(),
            _turn: turn,
            _lifecycle: lifecycle,
        });
        debug!("Ingress bridge bound to client");
    }

    pub fn has_client(&self) -> bool {
        self.inner
            .binding
            .lock()
            .as_ref()
            .is_some_and(|b| b.client.upgrade().is_some())
    }

    /// Subscribe to the capture source. Idempotent.
    pub fn start_streaming(&self) -> ClientResult<()> {
        let inner = &self.inner;
        if !self.has_client() {
            return Err(ClientError::NoClientBound);
        }

        let mut slot = inner.capture_subscription.lock();
        if inner.streaming.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(inner);
        *slot = Some(inner.capture.subscribe(Box::new(move |chunk| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_chunk(chunk);
            }
        })));

        info!(
            respect_turn_state = inner.respect_turn_state.load(Ordering::SeqCst),
            "Audio streaming started"
        );
        Ok(())
    }

    /// Unsubscribe from the capture source. Idempotent.
    pub fn stop_streaming(&self) {
        self.inner.stop_streaming();
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    pub fn set_respect_turn_state(&self, respect: bool) {
        self.inner
            .respect_turn_state
            .store(respect, Ordering::SeqCst);
    }

    pub fn status(&self) -> IngressStatus {
        let inner = &self.inner;
        IngressStatus {
            is_streaming: inner.streaming.load(Ordering::SeqCst),
            is_connected: inner.connected.load(Ordering::SeqCst),
            user_has_turn: inner.user_has_turn.load(Ordering::SeqCst),
            respect_turn_state: inner.respect_turn_state.load(Ordering::SeqCst),
            streamed: inner.streamed.load(Ordering::SeqCst),
            suppressed: inner.suppressed.load(Ordering::SeqCst),
            send_errors: inner.send_errors.load(Ordering::SeqCst),
        }
    }

    /// Zero the counters. Subscriptions are untouched.
    pub fn reset_stats(&self) {
        let inner = &self.inner;
        inner.streamed.store(0, Ordering::SeqCst);
        inner.suppressed.store(0, Ordering::SeqCst);
        inner.send_errors.store(0, Ordering::SeqCst);
    }

    /// Stop streaming and unbind. Idempotent.
    pub fn destroy(&self) {
        self.set_client(None);
    }
}

impl BridgeInner {
    fn stop_streaming(&self) {
        let subscription = self.capture_subscription.lock().take();
        if self.streaming.swap(false, Ordering::SeqCst) {
            info!("Audio streaming stopped");
        }
        drop(subscription);
    }

    fn handle_chunk(&self, chunk: &AudioChunk) {
        if !self.streaming.load(Ordering::SeqCst) {
            return;
        }

        let should_send = !self.respect_turn_state.load(Ordering::SeqCst)
            || (self.connected.load(Ordering::SeqCst) && self.user_has_turn.load(Ordering::SeqCst));

        if !should_send {
            self.suppressed.fetch_add(1, Ordering::SeqCst);
            trace!(sequence = chunk.sequence, "Chunk suppressed");
            return;
        }

        self.streamed.fetch_add(1, Ordering::SeqCst);

        let client = self
            .binding
            .lock()
            .as_ref()
            .and_then(|binding| binding.client.upgrade());

        let result = match client {
            Some(client) => client.send_binary_frame(chunk.bytes.clone()),
            None => Err(ClientError::NoClientBound),
        };

        if let Err(e) = result {
            self.send_errors.fetch_add(1, Ordering::SeqCst);
            debug!(sequence = chunk.sequence, "Failed to send audio chunk: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::capture::BroadcastCaptureSource;
    use crate::core::realtime::RealtimeClientConfig;
    use crate::core::transport::{MemoryPeer, MemoryTransport};
    use std::time::Duration;

    fn client() -> (RealtimeClient, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let config = RealtimeClientConfig {
            base_url: "ws://memory.local/ws".to_string(),
            auth_token: Some("t".to_string()),
            heartbeat_interval: None,
            ..Default::default()
        };
        (RealtimeClient::new(config, Arc::new(transport)).unwrap(), peer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn test_start_without_client_fails() {
        let bridge = AudioIngressBridge::new(Arc::new(BroadcastCaptureSource::new()), true);
        assert_eq!(bridge.start_streaming(), Err(ClientError::NoClientBound));
        assert!(!bridge.status().is_streaming);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
        let (client, _peer) = client();
        bridge.set_client(Some(&client));

        bridge.start_streaming().unwrap();
        bridge.start_streaming().unwrap();
        assert_eq!(capture.subscriber_count(), 1);

        bridge.stop_streaming();
        bridge.stop_streaming();
        assert_eq!(capture.subscriber_count(), 0);
        assert!(!bridge.is_streaming());
    }

    #[tokio::test]
    async fn test_gating_follows_turn() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
        let (client, peer) = client();
        bridge.set_client(Some(&client));
        client.connect().await.unwrap();
        bridge.start_streaming().unwrap();

        capture.publish_samples(&[1; 160], 16000);
        assert_eq!(bridge.status().suppressed, 1);
        assert_eq!(bridge.status().streamed, 0);

        peer.send_json(serde_json::json!({"type": "user_turn_start"}))
            .await;
        settle().await;

        capture.publish_samples(&[1; 160], 16000);
        let status = bridge.status();
        assert!(status.is_connected);
        assert!(status.user_has_turn);
        assert_eq!(status.streamed, 1);
        assert!(peer.wait_for_frames(1, Duration::from_secs(1)).await);
        assert_eq!(peer.binary_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_ignoring_turn_sends_regardless() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), false);
        let (client, peer) = client();
        bridge.set_client(Some(&client));
        client.connect().await.unwrap();
        bridge.start_streaming().unwrap();

        for _ in 0..3 {
            capture.publish_samples(&[1; 160], 16000);
        }
        assert_eq!(bridge.status().streamed, 3);
        assert_eq!(bridge.status().suppressed, 0);
        assert!(peer.wait_for_frames(3, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_send_failure_counts_as_streamed() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), false);
        let (client, _peer) = client();
        bridge.set_client(Some(&client));
        bridge.start_streaming().unwrap();

        capture.publish_samples(&[1; 160], 16000);
        capture.publish_samples(&[1; 160], 16000);

        let status = bridge.status();
        assert_eq!(status.streamed, 2);
        assert_eq!(status.send_errors, 2);
        assert!(status.is_streaming);
    }

    #[tokio::test]
    async fn test_rebinding_drops_old_subscriptions() {
        let bridge = AudioIngressBridge::new(Arc::new(BroadcastCaptureSource::new()), true);
        let (first, _p1) = client();
        let (second, _p2) = client();

        bridge.set_client(Some(&first));
        assert_eq!(first.turn().listener_count(), 1);

        bridge.set_client(Some(&first));
        assert_eq!(first.turn().listener_count(), 1);

        bridge.set_client(Some(&second));
        assert_eq!(first.turn().listener_count(), 0);
        assert_eq!(second.turn().listener_count(), 1);

        bridge.set_client(None);
        assert_eq!(second.turn().listener_count(), 0);
        assert!(!bridge.has_client());
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_subscription() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
        let (client, _peer) = client();
        bridge.set_client(Some(&client));
        bridge.start_streaming().unwrap();

        capture.publish_samples(&[0; 160], 16000);
        bridge.reset_stats();

        let status = bridge.status();
        assert_eq!(status.suppressed, 0);
        assert!(status.is_streaming);
        assert_eq!(capture.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_stops_streaming() {
        let capture = BroadcastCaptureSource::new();
        let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
        let (client, _peer) = client();
        bridge.set_client(Some(&client));
        client.connect().await.unwrap();
        bridge.start_streaming().unwrap();

        client.disconnect();

        let status = bridge.status();
        assert!(!status.is_streaming);
        assert!(!status.is_connected);
        assert_eq!(capture.subscriber_count(), 0);
    }
}
