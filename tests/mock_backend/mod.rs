//! WebSocket Mock Backend
//!
//! Plays the conversation backend on a loopback port:
//! - Greets every connection with `session_started` and hands the user the turn
//! - Answers application-level `ping` with `pong`
//! - Replies to `user_text` with a scripted agent turn (transcript + PCM16 audio)
//! - Acknowledges `client_wants_cancel` with `agent_cancelled`
//! - Drops the TCP connection without a close frame on `test_drop`

// Not every test binary uses every helper
#![allow(dead_code)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Samples per scripted agent audio frame (100ms at 24kHz).
pub const AGENT_FRAME_SAMPLES: usize = 2400;
/// Audio frames sent per scripted agent reply.
pub const AGENT_FRAMES_PER_REPLY: usize = 2;

/// Observations shared between the server and the test.
#[derive(Default)]
pub struct BackendState {
    pub connection_count: AtomicU64,
    pub binary_frames: AtomicU64,
    pub request_uris: Mutex<Vec<String>>,
    pub text_frames: Mutex<Vec<Value>>,
    pub close_codes: Mutex<Vec<u16>>,
}

impl BackendState {
    pub fn connections(&self) -> u64 {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn binary_count(&self) -> u64 {
        self.binary_frames.load(Ordering::SeqCst)
    }

    pub fn frames_of_type(&self, event_type: &str) -> Vec<Value> {
        self.text_frames
            .lock()
            .iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some(event_type))
            .cloned()
            .collect()
    }
}

/// Running mock backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Arc<BackendState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    /// Bind to an ephemeral loopback port and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BackendState::default());

        let server_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = server_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        eprintln!("Mock backend connection error: {}", e);
                    }
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn agent_audio_frame() -> Bytes {
    let mut data = Vec::with_capacity(AGENT_FRAME_SAMPLES * 2);
    for i in 0..AGENT_FRAME_SAMPLES {
        let sample = ((i % 100) as i16 - 50) * 200;
        data.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(data)
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<BackendState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let uris = state.clone();
    let ws_stream = accept_hdr_async(
        stream,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            uris.request_uris.lock().push(request.uri().to_string());
            Ok(response)
        },
    )
    .await?;
    let (mut write, mut read) = ws_stream.split();

    let conn_id = state.connection_count.fetch_add(1, Ordering::SeqCst) + 1;

    let hello = json!({"type": "session_started", "session_id": format!("mock-session-{}", conn_id)});
    write.send(Message::Text(hello.to_string().into())).await?;
    write
        .send(Message::Text(json!({"type": "user_turn_start"}).to_string().into()))
        .await?;

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Binary(_audio)) => {
                state.binary_frames.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Message::Text(text)) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                state.text_frames.lock().push(value.clone());

                match value.get("type").and_then(|t| t.as_str()) {
                    Some("ping") => {
                        write
                            .send(Message::Text(json!({"type": "pong"}).to_string().into()))
                            .await?;
                    }
                    Some("user_text") => {
                        let said = value.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        let script = [
                            json!({"type": "user_turn_end"}),
                            json!({"type": "transcript", "role": "user", "text": said, "is_final": true}),
                            json!({"type": "agent_turn_start"}),
                            json!({"type": "transcript", "role": "assistant", "text": "Hello from the agent", "is_final": true}),
                        ];
                        for event in script {
                            write.send(Message::Text(event.to_string().into())).await?;
                        }
                        for _ in 0..AGENT_FRAMES_PER_REPLY {
                            write.send(Message::Binary(agent_audio_frame())).await?;
                        }
                        for event in [json!({"type": "agent_turn_end"}), json!({"type": "user_turn_start"})] {
                            write.send(Message::Text(event.to_string().into())).await?;
                        }
                    }
                    Some("client_wants_cancel") => {
                        write
                            .send(Message::Text(json!({"type": "agent_cancelled"}).to_string().into()))
                            .await?;
                    }
                    Some("test_drop") => {
                        // Abandon the socket without a close frame
                        return Ok(());
                    }
                    _ => {}
                }
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    state.close_codes.lock().push(u16::from(frame.code));
                }
                break;
            }
            Ok(Message::Ping(data)) => {
                write.send(Message::Pong(data)).await?;
            }
            Err(e) => {
                eprintln!("Mock backend WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
