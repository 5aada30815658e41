//! Media-stream WebSocket transport.
//!
//! Speaks a JSON-framed bidirectional media protocol: each frame is a
//! serde-tagged object with an `event` discriminator, audio payloads are
//! base64 µ-law. One WebSocket carries every call of the process; frames
//! are routed by call id.

use crate::error::{CallError, Result};
use crate::session::CallId;
use crate::telephony::{TelephonyAdapter, TelephonyEvent};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event channel depth; inbound audio arrives every 20ms per call.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Frames sent to the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientFrame {
    /// Place an outbound call. The call id is assigned client-side so the
    /// reply path needs no request correlation.
    Dial { call_id: String, phone: String },
    /// Outbound audio, base64 µ-law.
    Media { call_id: String, payload: String },
    /// Drop the provider-side egress queue for a call.
    Clear { call_id: String },
    Hangup { call_id: String },
}

/// Frames received from the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ServerFrame {
    /// Media for a call has started.
    Start {
        call_id: String,
        #[serde(default)]
        caller: String,
    },
    /// Inbound audio, base64 µ-law.
    Media { call_id: String, payload: String },
    /// The call ended provider-side.
    Stop { call_id: String },
}

/// WebSocket media-stream telephony adapter.
pub struct MediaStreamAdapter {
    outbound_tx: mpsc::UnboundedSender<ClientFrame>,
    cancel: CancellationToken,
}

impl MediaStreamAdapter {
    /// Connect to the provider's media WebSocket.
    ///
    /// Returns the adapter plus the inbound event stream. The connection
    /// task runs until the socket closes or [`shutdown`](Self::shutdown)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket connection fails.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<TelephonyEvent>)> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| CallError::Telephony(format!("media socket connect failed: {e}")))?;
        info!("media socket connected: {url}");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (event_tx, event_rx) = mpsc::channel::<TelephonyEvent>(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let json = match serde_json::to_string(&frame) {
                            Ok(j) => j,
                            Err(e) => {
                                warn!("failed to serialize media frame: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!("media socket send failed: {e}");
                            break;
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_server_frame(&text) {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("media socket closed by provider");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("media socket read error: {e}");
                                break;
                            }
                            _ => {} // Ping/Pong handled by tungstenite.
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                outbound_tx,
                cancel,
            },
            event_rx,
        ))
    }

    /// Close the media socket and end the connection task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .map_err(|_| CallError::Telephony("media socket task is gone".to_owned()))
    }
}

#[async_trait]
impl TelephonyAdapter for MediaStreamAdapter {
    async fn make_call(&self, phone: &str) -> Result<CallId> {
        let call = CallId::generate();
        self.send_frame(ClientFrame::Dial {
            call_id: call.0.clone(),
            phone: phone.to_owned(),
        })?;
        Ok(call)
    }

    async fn end_call(&self, call: &CallId) -> Result<()> {
        self.send_frame(ClientFrame::Hangup {
            call_id: call.0.clone(),
        })
    }

    async fn send_audio(&self, call: &CallId, audio: Bytes) -> Result<()> {
        self.send_frame(ClientFrame::Media {
            call_id: call.0.clone(),
            payload: BASE64.encode(&audio),
        })
    }

    async fn clear_egress_buffer(&self, call: &CallId) -> Result<()> {
        self.send_frame(ClientFrame::Clear {
            call_id: call.0.clone(),
        })
    }
}

/// Parse one provider frame into a telephony event.
///
/// Unparseable frames and undecodable payloads are logged and dropped;
/// one bad frame must not kill the media task.
fn parse_server_frame(text: &str) -> Option<TelephonyEvent> {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("ignoring unparseable media frame: {e}");
            return None;
        }
    };
    match frame {
        ServerFrame::Start { call_id, caller } => Some(TelephonyEvent::CallStarted {
            call: CallId(call_id),
            caller,
        }),
        ServerFrame::Media { call_id, payload } => match BASE64.decode(payload) {
            Ok(audio) => Some(TelephonyEvent::InboundAudio {
                call: CallId(call_id),
                audio: Bytes::from(audio),
            }),
            Err(e) => {
                debug!("dropping media frame with bad payload: {e}");
                None
            }
        },
        ServerFrame::Stop { call_id } => Some(TelephonyEvent::CallEnded {
            call: CallId(call_id),
        }),
    }
}
