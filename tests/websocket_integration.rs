//! End-to-end tests of the realtime client over a real WebSocket.
//!
//! Every test starts a loopback mock backend (see `mock_backend`) and drives
//! a `RealtimeClient` built with the tokio-tungstenite transport.

mod mock_backend;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use mock_backend::{AGENT_FRAME_SAMPLES, AGENT_FRAMES_PER_REPLY, MockBackend, wait_until};
use waav_voice_client::{
    AudioEgressScheduler, AudioIngressBridge, BroadcastCaptureSource, ClientCommand,
    ConnectionState, EgressConfig, EventKind, LifecycleEvent, RealtimeClient,
    RealtimeClientConfig, ReconnectionPolicy, ServerEvent, TurnHolder, WavRenderSink,
};

const WAIT: Duration = Duration::from_secs(5);

fn client_config(backend: &MockBackend) -> RealtimeClientConfig {
    RealtimeClientConfig {
        base_url: backend.url(),
        auth_token: Some("integration-token".to_string()),
        heartbeat_interval: None,
        connect_timeout: Duration::from_secs(2),
        reconnection: ReconnectionPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_adopts_session_and_receives_turn() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    assert!(wait_until(WAIT, || client.turn().holder() == TurnHolder::User).await);
    assert!(client.can_send_input());
    assert!(wait_until(WAIT, || client.session_id().is_some()).await);
    assert_eq!(client.session_id().as_deref(), Some("mock-session-1"));

    let uris = backend.state.request_uris.lock().clone();
    assert_eq!(uris.len(), 1);
    assert!(uris[0].contains("token=integration-token"));
    assert!(!uris[0].contains("session_id"));

    client.destroy();
}

#[tokio::test]
async fn test_text_turn_plays_agent_audio_gaplessly() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    let transcripts = Arc::new(Mutex::new(Vec::new()));
    let _transcripts = {
        let transcripts = transcripts.clone();
        client.on_event(EventKind::Transcript, move |event| {
            if let ServerEvent::Transcript { text, .. } = event {
                transcripts.lock().push(text.clone());
            }
        })
    };

    let sink = Arc::new(WavRenderSink::new(24000));
    let scheduler = AudioEgressScheduler::new(sink.clone(), EgressConfig::default());
    let _playback = scheduler.bind(&client);

    client.connect().await.unwrap();
    assert!(wait_until(WAIT, || client.can_send_input()).await);

    client
        .send_command(&ClientCommand::UserText {
            text: "hi there".to_string(),
        })
        .unwrap();

    assert!(wait_until(WAIT, || transcripts.lock().len() == 2).await);
    assert!(
        wait_until(WAIT, || scheduler.status().played == AGENT_FRAMES_PER_REPLY as u64).await
    );
    // The scripted reply ends by handing the turn back
    assert!(wait_until(WAIT, || client.turn().holder() == TurnHolder::User).await);

    assert_eq!(
        *transcripts.lock(),
        vec!["hi there".to_string(), "Hello from the agent".to_string()]
    );
    assert_eq!(backend.state.frames_of_type("user_text").len(), 1);

    // Two 100ms frames overlapped by 20ms
    let timeline = sink.render();
    assert!(timeline.len() >= AGENT_FRAME_SAMPLES * 2 - 480);
    assert!(client.stats().binary_frames_received >= AGENT_FRAMES_PER_REPLY as u64);

    client.destroy();
}

#[tokio::test]
async fn test_ingress_streams_only_while_user_holds_turn() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    let capture = BroadcastCaptureSource::new();
    let bridge = AudioIngressBridge::new(Arc::new(capture.clone()), true);
    bridge.set_client(Some(&client));
    bridge.start_streaming().unwrap();

    client.connect().await.unwrap();
    assert!(wait_until(WAIT, || client.can_send_input()).await);

    for _ in 0..5 {
        capture.publish_samples(&[1000i16; 320], 16000);
    }
    assert!(wait_until(WAIT, || backend.state.binary_count() == 5).await);

    // Agent takes the turn: audio is held back
    client
        .send_command(&ClientCommand::UserText {
            text: "your turn".to_string(),
        })
        .unwrap();
    assert!(wait_until(WAIT, || backend.state.frames_of_type("user_text").len() == 1).await);

    let status = bridge.status();
    assert_eq!(status.streamed, 5);
    assert_eq!(status.send_errors, 0);

    bridge.destroy();
    client.destroy();
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();
    client.connect().await.unwrap();

    client.send_command(&ClientCommand::Ping).unwrap();
    assert!(wait_until(WAIT, || client.stats().text_frames_received >= 3).await);
    assert_eq!(backend.state.frames_of_type("ping").len(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.destroy();
}

#[tokio::test]
async fn test_cancel_agent_is_acknowledged() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    let cancelled = Arc::new(Mutex::new(0));
    let _cancelled = {
        let cancelled = cancelled.clone();
        client.on_event(EventKind::AgentCancelled, move |_| *cancelled.lock() += 1)
    };

    client.connect().await.unwrap();
    client.cancel_agent().unwrap();

    assert!(wait_until(WAIT, || *cancelled.lock() == 1).await);
    assert_eq!(backend.state.frames_of_type("client_wants_cancel").len(), 1);

    client.destroy();
}

#[tokio::test]
async fn test_dropped_socket_reconnects_and_resumes_session() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    let _lifecycle = {
        let lifecycle = lifecycle.clone();
        client.on_lifecycle(move |e| lifecycle.lock().push(e.clone()))
    };

    client.connect().await.unwrap();
    assert!(wait_until(WAIT, || client.session_id().is_some()).await);

    client
        .send_raw_command(&json!({"type": "test_drop"}))
        .unwrap();

    assert!(
        wait_until(WAIT, || lifecycle
            .lock()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Reconnected { .. })))
        .await
    );
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(backend.state.connections(), 2);

    // The second connect resumes the first session
    let uris = backend.state.request_uris.lock().clone();
    assert!(uris[1].contains("session_id=mock-session-1"));
    assert_eq!(client.session_id().as_deref(), Some("mock-session-1"));

    let events = lifecycle.lock().clone();
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Disconnected { .. }))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, LifecycleEvent::Reconnecting { attempt: 1, .. }))
    );

    client.destroy();
}

#[tokio::test]
async fn test_disconnect_sends_normal_close() {
    let backend = MockBackend::start().await;
    let client = RealtimeClient::with_websocket(client_config(&backend)).unwrap();

    client.connect().await.unwrap();
    client.disconnect();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(wait_until(WAIT, || !backend.state.close_codes.lock().is_empty()).await);
    assert_eq!(*backend.state.close_codes.lock(), vec![1000]);

    // No reconnection after a clean disconnect
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.state.connections(), 1);
}
