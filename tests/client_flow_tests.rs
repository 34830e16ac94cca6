//! Conversation flow tests over the in-memory transport.
//!
//! These exercise the engine, the turn arbiter and both audio bridges
//! together, with a `MemoryPeer` standing in for the backend.

mod mock_backend;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;

use mock_backend::wait_until;
use waav_voice_client::core::audio::SourceId;
use waav_voice_client::core::audio::pcm::{decode_pcm16, samples_to_bytes};
use waav_voice_client::{
    AudioCaptureSource, AudioEgressScheduler, AudioIngressBridge, AudioResult, AudioSink,
    BroadcastCaptureSource, ClientCommand, ClientError, CloseCode, ConnectionState, EgressConfig, LifecycleEvent, MemoryPeer,
    MemoryTransport, OutboundFrame, RealtimeClient, RealtimeClientConfig, ReconnectionEvent,
    ReconnectionManager, ReconnectionPolicy, WireMessage,
};

const WAIT: Duration = Duration::from_secs(2);

fn config() -> RealtimeClientConfig {
    RealtimeClientConfig {
        base_url: "ws://memory.local/ws".to_string(),
        auth_token: Some("flow-token".to_string()),
        heartbeat_interval: None,
        connect_timeout: Duration::from_millis(200),
        reconnection: ReconnectionPolicy {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn connected_client() -> (RealtimeClient, MemoryPeer) {
    let (transport, peer) = MemoryTransport::pair();
    let client = RealtimeClient::new(config(), Arc::new(transport)).unwrap();
    client.connect().await.unwrap();
    (client, peer)
}

async fn give_user_turn(client: &RealtimeClient, peer: &MemoryPeer) {
    assert!(peer.send_json(json!({"type": "user_turn_start"})).await);
    assert!(wait_until(WAIT, || client.can_send_input()).await);
}

/// Playback device with a hand-driven clock.
#[derive(Default)]
struct RecordingSink {
    now: Mutex<f64>,
    scheduled: Mutex<Vec<(SourceId, f64, usize)>>,
    stopped: Mutex<Vec<SourceId>>,
}

impl AudioSink for RecordingSink {
    fn current_time(&self) -> f64 {
        *self.now.lock()
    }

    fn schedule(
        &self,
        samples: Vec<f32>,
        _sample_rate: u32,
        start_at: f64,
        _gain: f32,
    ) -> AudioResult<SourceId> {
        let mut scheduled = self.scheduled.lock();
        let id = scheduled.len() as SourceId + 1;
        scheduled.push((id, start_at, samples.len()));
        Ok(id)
    }

    fn stop(&self, source: SourceId) {
        self.stopped.lock().push(source);
    }
}

fn pcm_frame_ms(ms: usize) -> Bytes {
    samples_to_bytes(&vec![500i16; 24 * ms])
}

#[tokio::test]
async fn test_conversation_scenario() {
    let (client, peer) = connected_client().await;

    let capture = BroadcastCaptureSource::new();
    let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
    bridge.set_client(Some(&client));
    bridge.start_streaming().unwrap();

    give_user_turn(&client, &peer).await;

    for expected in 1..=3 {
        capture.publish_samples(&[100i16; 320], 16000);
        assert_eq!(bridge.status().streamed, expected);
    }

    assert!(peer.send_json(json!({"type": "user_turn_end"})).await);
    assert!(wait_until(WAIT, || !client.can_send_input()).await);

    capture.publish_samples(&[100i16; 320], 16000);
    let status = bridge.status();
    assert_eq!(status.suppressed, 1);
    assert_eq!(status.streamed, 3);

    assert!(peer.wait_for_frames(3, WAIT).await);
    assert_eq!(peer.binary_frames().len(), 3);

    client.disconnect();
    assert!(!bridge.status().is_streaming);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_suppressed_chunks_never_reach_transport() {
    let (client, peer) = connected_client().await;

    let capture = BroadcastCaptureSource::new();
    let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
    bridge.set_client(Some(&client));
    bridge.start_streaming().unwrap();

    // Agent holds the turn from the start
    for _ in 0..10 {
        capture.publish_samples(&[100i16; 160], 16000);
    }

    let status = bridge.status();
    assert_eq!(status.streamed, 0);
    assert_eq!(status.suppressed, 10);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.binary_frames().is_empty());
    assert_eq!(client.stats().binary_frames_sent, 0);
}

#[tokio::test]
async fn test_ignoring_turn_state_streams_everything() {
    let (client, peer) = connected_client().await;

    let capture = BroadcastCaptureSource::new();
    let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), false);
    bridge.set_client(Some(&client));
    bridge.start_streaming().unwrap();

    capture.publish_samples(&[1i16; 160], 16000);
    give_user_turn(&client, &peer).await;
    capture.publish_samples(&[1i16; 160], 16000);

    assert_eq!(bridge.status().streamed, 2);
    assert!(peer.wait_for_frames(2, WAIT).await);
    assert_eq!(peer.binary_frames().len(), 2);
}

#[tokio::test]
async fn test_agent_turn_end_alone_never_grants_input() {
    let (client, peer) = connected_client().await;

    assert!(peer.send_json(json!({"type": "agent_turn_start"})).await);
    assert!(peer.send_json(json!({"type": "agent_turn_end"})).await);
    assert!(peer.send_json(json!({"type": "agent_turn_end"})).await);

    assert!(wait_until(WAIT, || client.stats().text_frames_received == 3).await);
    assert!(!client.can_send_input());
}

#[tokio::test]
async fn test_chunk_racing_turn_end_is_sent_or_suppressed() {
    let (client, peer) = connected_client().await;

    let capture = BroadcastCaptureSource::new();
    let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
    bridge.set_client(Some(&client));
    bridge.start_streaming().unwrap();
    give_user_turn(&client, &peer).await;

    // Arrival order decides; either outcome is valid
    let signal = {
        let peer = peer.clone();
        tokio::spawn(async move { peer.send_json(json!({"type": "user_turn_end"})).await })
    };
    capture.publish_samples(&[7i16; 160], 16000);
    assert!(signal.await.unwrap());

    let status = bridge.status();
    assert_eq!(status.streamed + status.suppressed, 1);
}

#[tokio::test]
async fn test_reconnection_gives_up_after_max_attempts() {
    let manager = ReconnectionManager::new(ReconnectionPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
        ..Default::default()
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let _events = {
        let events = events.clone();
        manager.on_event(move |e| events.lock().push(e.clone()))
    };

    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = calls.clone();
        manager.start_reconnection(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::ConnectionFailed("refused".to_string()))
            }
        });
    }

    assert!(wait_until(WAIT, || !manager.is_reconnecting()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let failures = events
        .lock()
        .iter()
        .filter(|e| matches!(e, ReconnectionEvent::ReconnectionFailed { .. }))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_client_reconnection_exhaustion_ends_disconnected() {
    let (client, peer) = connected_client().await;

    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    let _lifecycle = {
        let lifecycle = lifecycle.clone();
        client.on_lifecycle(move |e| lifecycle.lock().push(e.clone()))
    };

    peer.refuse_opens(true);
    assert!(peer.drop_link().await);

    assert!(wait_until(WAIT, || client.state() == ConnectionState::Disconnected).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One initial connect plus three retries
    assert_eq!(peer.open_attempts(), 4);

    let events = lifecycle.lock().clone();
    let failed = events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::ReconnectionFailed { .. }))
        .count();
    assert_eq!(failed, 1);
    assert!(matches!(
        events.last(),
        Some(LifecycleEvent::Disconnected { .. })
    ));
}

#[tokio::test]
async fn test_heartbeat_death_reconnects_with_distinct_code() {
    let (transport, peer) = MemoryTransport::pair();
    let client = RealtimeClient::new(
        RealtimeClientConfig {
            heartbeat_interval: Some(Duration::from_millis(30)),
            ..config()
        },
        Arc::new(transport),
    )
    .unwrap();

    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    let _lifecycle = {
        let lifecycle = lifecycle.clone();
        client.on_lifecycle(move |e| lifecycle.lock().push(e.clone()))
    };

    // No pongs: the link is declared dead and the engine starts reconnecting
    client.connect().await.unwrap();
    assert!(
        wait_until(WAIT, || lifecycle
            .lock()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Reconnecting { .. })))
        .await
    );

    client.destroy();

    let events = lifecycle.lock().clone();
    assert!(!events.iter().any(|e| matches!(
        e,
        LifecycleEvent::Disconnected { code, .. } if *code == CloseCode::HEARTBEAT_TIMEOUT
    )));
}

#[tokio::test]
async fn test_back_to_back_frames_are_gapless() {
    let sink = Arc::new(RecordingSink::default());
    *sink.now.lock() = 1.0;
    let scheduler = AudioEgressScheduler::new(sink.clone(), EgressConfig::default());

    scheduler.enqueue(pcm_frame_ms(100));
    scheduler.enqueue(pcm_frame_ms(100));

    let scheduled = sink.scheduled.lock().clone();
    assert_eq!(scheduled.len(), 2);
    let (_, first_start, _) = scheduled[0];
    let (_, second_start, _) = scheduled[1];
    assert!(second_start < first_start + 0.1);
    assert!(second_start >= first_start);
}

#[tokio::test]
async fn test_stop_playback_twice_is_noop() {
    let sink = Arc::new(RecordingSink::default());
    let scheduler = AudioEgressScheduler::new(sink.clone(), EgressConfig::default());
    scheduler.enqueue(pcm_frame_ms(100));
    assert!(scheduler.is_playing());

    scheduler.stop_playback();
    scheduler.stop_playback();

    assert_eq!(*sink.stopped.lock(), vec![1]);
    assert!(!scheduler.is_playing());
}

#[tokio::test]
async fn test_start_streaming_twice_subscribes_once() {
    let (client, _peer) = connected_client().await;
    let capture = Arc::new(BroadcastCaptureSource::new());
    let bridge = AudioIngressBridge::new(capture.clone(), true);
    bridge.set_client(Some(&client));

    bridge.start_streaming().unwrap();
    bridge.start_streaming().unwrap();

    assert_eq!(capture.subscriber_count(), 1);
}

#[test]
fn test_zero_samples_decode_to_zero() {
    let decoded = decode_pcm16(&samples_to_bytes(&[0i16; 480]));
    assert_eq!(decoded.len(), 480);
    assert!(decoded.iter().all(|&s| s == 0.0));
}

#[tokio::test]
async fn test_commands_and_audio_use_separate_frame_kinds() {
    let (client, peer) = connected_client().await;

    client
        .send_binary_frame(Bytes::from_static(b"{\"type\":\"ping\"}"))
        .unwrap();
    client.send_command(&ClientCommand::Ping).unwrap();
    client
        .send_raw_command(&json!({"type": "set_voice", "voice": "alloy"}))
        .unwrap();

    assert!(peer.wait_for_frames(3, WAIT).await);
    let frames = peer.frames();
    assert!(matches!(
        &frames[0],
        OutboundFrame::Message(WireMessage::Binary(_))
    ));
    assert!(matches!(
        &frames[1],
        OutboundFrame::Message(WireMessage::Text(_))
    ));
    assert!(matches!(
        &frames[2],
        OutboundFrame::Message(WireMessage::Text(_))
    ));
    assert_eq!(client.stats().commands_sent, 2);
}

#[tokio::test]
async fn test_agent_audio_flows_to_scheduler() {
    let (client, peer) = connected_client().await;
    let sink = Arc::new(RecordingSink::default());
    let scheduler = AudioEgressScheduler::new(sink.clone(), EgressConfig::default());
    let _binding = scheduler.bind(&client);

    assert!(peer.send_binary(pcm_frame_ms(40)).await);
    assert!(peer.send_binary(pcm_frame_ms(40)).await);

    assert!(wait_until(WAIT, || scheduler.status().played == 2).await);
    let scheduled = sink.scheduled.lock().clone();
    assert_eq!(scheduled[0].2, 960);
}
