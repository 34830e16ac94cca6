//! In-process loopback transport.
//!
//! [`MemoryTransport`] hands out links whose far end is a [`MemoryPeer`]. The
//! peer plays the backend: it records every frame the client writes, injects
//! inbound messages, closes links with arbitrary codes, and can refuse or
//! stall connect attempts. Useful for embedding the client without a network
//! and for exercising reconnection paths deterministically.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};
use tracing::debug;
use url::Url;

use super::{
    CloseCode, LINK_CHANNEL_CAPACITY, OutboundFrame, Transport, TransportEvent, TransportLink,
    WireMessage,
};
use crate::core::error::{ClientError, ClientResult};

#[derive(Default)]
struct PeerState {
    /// Sender for the currently open link, if any.
    current: Option<mpsc::Sender<TransportEvent>>,
    /// Every frame written by the client, across links.
    frames: Vec<OutboundFrame>,
    opened_urls: Vec<Url>,
    open_attempts: u32,
    fail_next_opens: u32,
    refuse_opens: bool,
    binary_unsupported: bool,
    auto_pong: bool,
}

struct Shared {
    state: Mutex<PeerState>,
    frame_notify: Notify,
    /// `true` while connect attempts are held back.
    stall: watch::Sender<bool>,
}

/// Client side of the loopback transport.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Backend side of the loopback transport.
#[derive(Clone)]
pub struct MemoryPeer {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a transport and the peer that controls it.
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let shared = Arc::new(Shared {
            state: Mutex::new(PeerState::default()),
            frame_notify: Notify::new(),
            stall: watch::Sender::new(false),
        });
        (
            MemoryTransport {
                shared: shared.clone(),
            },
            MemoryPeer { shared },
        )
    }
}

fn is_ping(frame: &OutboundFrame) -> bool {
    match frame {
        OutboundFrame::Message(WireMessage::Text(text)) => {
            serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
                .unwrap_or(false)
        }
        _ => false,
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &Url) -> ClientResult<TransportLink> {
        {
            let mut state = self.shared.state.lock();
            state.open_attempts += 1;
            state.opened_urls.push(url.clone());

            if state.refuse_opens {
                return Err(ClientError::ConnectionFailed(
                    "connection refused by peer".to_string(),
                ));
            }
            if state.fail_next_opens > 0 {
                state.fail_next_opens -= 1;
                return Err(ClientError::ConnectionFailed(
                    "connection refused by peer".to_string(),
                ));
            }
        }

        let mut stall = self.shared.stall.subscribe();
        loop {
            let stalled = *stall.borrow_and_update();
            if !stalled || stall.changed().await.is_err() {
                break;
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(LINK_CHANNEL_CAPACITY);

        let supports_binary = {
            let mut state = self.shared.state.lock();
            state.current = Some(inbound_tx.clone());
            !state.binary_unsupported
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, OutboundFrame::Close { .. });
                let answer_ping = is_ping(&frame);
                let auto_pong = {
                    let mut state = shared.state.lock();
                    state.frames.push(frame);
                    if closing
                        && state
                            .current
                            .as_ref()
                            .is_some_and(|tx| tx.same_channel(&inbound_tx))
                    {
                        state.current = None;
                    }
                    state.auto_pong
                };
                shared.frame_notify.notify_waiters();

                if answer_ping && auto_pong {
                    let _ = inbound_tx
                        .send(TransportEvent::Message(WireMessage::Text(
                            r#"{"type":"pong"}"#.to_string(),
                        )))
                        .await;
                }
                if closing {
                    break;
                }
            }
            debug!("Memory link closed");
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            supports_binary,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryPeer {
    fn current(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.shared.state.lock().current.clone()
    }

    /// Whether a link is currently open.
    pub fn is_linked(&self) -> bool {
        self.current().is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver an inbound event on the open link. Returns false without a link.
    pub async fn push(&self, event: TransportEvent) -> bool {
        match self.current() {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(TransportEvent::Message(WireMessage::Text(text.into())))
            .await
    }

    pub async fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(value.to_string()).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.push(TransportEvent::Message(WireMessage::Binary(data.into())))
            .await
    }

    /// Close the open link from the backend side.
    pub async fn close(&self, code: CloseCode, reason: &str) -> bool {
        let Some(tx) = self.shared.state.lock().current.take() else {
            return false;
        };
        tx.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        })
        .await
        .is_ok()
    }

    /// Simulate a dropped connection (no close frame).
    pub async fn drop_link(&self) -> bool {
        self.close(CloseCode::ABNORMAL, "connection reset").await
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_opens(&self, count: u32) {
        self.shared.state.lock().fail_next_opens = count;
    }

    /// Fail every connect attempt until switched off.
    pub fn refuse_opens(&self, refuse: bool) {
        self.shared.state.lock().refuse_opens = refuse;
    }

    /// Hold connect attempts until switched off. Attempts already waiting
    /// resume when the stall is lifted, unless their caller gave up first.
    pub fn stall_opens(&self, stall: bool) {
        self.shared.stall.send_replace(stall);
    }

    /// Report subsequent links as unable to carry binary frames.
    pub fn set_binary_supported(&self, supported: bool) {
        self.shared.state.lock().binary_unsupported = !supported;
    }

    /// Answer application-level pings with pongs.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.state.lock().auto_pong = enabled;
    }

    pub fn open_attempts(&self) -> u32 {
        self.shared.state.lock().open_attempts
    }

    pub fn last_url(&self) -> Option<Url> {
        self.shared.state.lock().opened_urls.last().cloned()
    }

    /// Snapshot of every frame written by the client so far.
    pub fn frames(&self) -> Vec<OutboundFrame> {
        self.shared.state.lock().frames.clone()
    }

    /// Binary payloads written by the client.
    pub fn binary_frames(&self) -> Vec<Bytes> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Message(WireMessage::Binary(data)) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Text payloads written by the client, parsed as JSON.
    pub fn json_frames(&self) -> Vec<serde_json::Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Message(WireMessage::Text(text)) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    /// JSON frames whose `type` matches.
    pub fn json_frames_of_type(&self, event_type: &str) -> Vec<serde_json::Value> {
        self.json_frames()
            .into_iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some(event_type))
            .collect()
    }

    /// Close frames written by the client.
    pub fn close_frames(&self) -> Vec<(CloseCode, String)> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Close { code, reason } => Some((code, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_frames(&self) {
        self.shared.state.lock().frames.clear();
    }

    /// Wait until at least `count` frames have been recorded.
    pub async fn wait_for_frames(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.frame_notify.notified();
                if self.shared.state.lock().frames.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
