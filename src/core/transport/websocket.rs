//! WebSocket transport.
//!
//! Opens a `ws://` or `wss://` connection with tokio-tungstenite and pumps it
//! through a [`TransportLink`]. Text frames carry JSON, binary frames carry
//! raw PCM16 audio. Protocol-level pings are answered here and never reach
//! the client; application-level heartbeats travel as JSON text frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    CloseCode, LINK_CHANNEL_CAPACITY, OutboundFrame, Transport, TransportEvent, TransportLink,
    WireMessage,
};
use crate::core::error::{ClientError, ClientResult};

/// WebSocket transport backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

fn classify_connect_error(error: &tokio_tungstenite::tungstenite::Error) -> ClientError {
    let message = error.to_string();
    if message.contains("401") || message.contains("Unauthorized") {
        ClientError::ConnectionFailed("backend rejected the auth token (401)".to_string())
    } else if message.contains("403") || message.contains("Forbidden") {
        ClientError::ConnectionFailed("backend refused the session (403)".to_string())
    } else {
        ClientError::ConnectionFailed(message)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &Url) -> ClientResult<TransportLink> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| classify_connect_error(&e))?;

        info!(host = ?url.host_str(), "WebSocket connection established");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(LINK_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(LINK_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let result = match frame {
                            Some(OutboundFrame::Message(WireMessage::Text(text))) => {
                                ws_sink.send(Message::Text(text.into())).await
                            }
                            Some(OutboundFrame::Message(WireMessage::Binary(data))) => {
                                ws_sink.send(Message::Binary(data)).await
                            }
                            Some(OutboundFrame::Close { code, reason }) => {
                                debug!(%code, "Sending WebSocket close frame");
                                let frame = CloseFrame {
                                    code: WsCloseCode::from(code.0),
                                    reason: reason.into(),
                                };
                                let _ = ws_sink.send(Message::Close(Some(frame))).await;
                                break;
                            }
                            None => {
                                // Link dropped by the client
                                let _ = ws_sink.send(Message::Close(None)).await;
                                break;
                            }
                        };

                        if let Err(e) = result {
                            error!("Failed to write WebSocket frame: {}", e);
                            let _ = inbound_tx
                                .send(TransportEvent::Closed {
                                    code: CloseCode::ABNORMAL,
                                    reason: format!("write failed: {e}"),
                                })
                                .await;
                            break;
                        }
                    }

                    message = ws_stream.next() => {
                        let event = match message {
                            Some(Ok(Message::Text(text))) => {
                                TransportEvent::Message(WireMessage::Text(text.as_str().to_owned()))
                            }
                            Some(Ok(Message::Binary(data))) => {
                                TransportEvent::Message(WireMessage::Binary(data))
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!("Failed to answer WebSocket ping: {}", e);
                                }
                                continue;
                            }
                            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = frame
                                    .map(|f| (CloseCode(u16::from(f.code)), f.reason.as_str().to_owned()))
                                    .unwrap_or((CloseCode::ABNORMAL, String::new()));
                                info!(%code, "WebSocket closed by server");
                                let _ = inbound_tx.send(TransportEvent::Closed { code, reason }).await;
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                let _ = inbound_tx.send(TransportEvent::Error(e.to_string())).await;
                                let _ = inbound_tx
                                    .send(TransportEvent::Closed {
                                        code: CloseCode::ABNORMAL,
                                        reason: e.to_string(),
                                    })
                                    .await;
                                break;
                            }
                            None => {
                                let _ = inbound_tx
                                    .send(TransportEvent::Closed {
                                        code: CloseCode::ABNORMAL,
                                        reason: "stream ended".to_string(),
                                    })
                                    .await;
                                break;
                            }
                        };

                        if inbound_tx.send(event).await.is_err() {
                            debug!("Inbound receiver dropped, closing WebSocket");
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }

            debug!("WebSocket pump task ended");
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            supports_binary: true,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
