//! Websocket connection to the conversational agent service.
//!
//! The channel is long-lived for the session's duration. Static instructions
//! (stage list, tool declarations) are supplied once at open and never
//! renegotiated. On failure the bridge stops playback, emits a terminal
//! `ChannelClosed` event, and does NOT reconnect — reconnection is a
//! user-initiated action, and the controller's state is left untouched.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use url::Url;

use crate::bridge::audio::AudioSession;
use crate::bridge::event::{AgentEvent, AgentFrame, ToolDeclaration, declarations, parse_frame};
use crate::error::BridgeError;
use crate::session::{WidgetType, intake_stages};

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection parameters for the agent service.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ws_url: Url,
    pub auth_token: SecretString,
    pub connect_timeout: Duration,
    pub sample_rate_hz: u32,
}

/// One stage as declared to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct StageDescriptor {
    pub id: &'static str,
    pub label: &'static str,
    pub widget: WidgetType,
}

/// Static instructions supplied to the agent at open time only.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub patient_id: String,
    pub stages: Vec<StageDescriptor>,
    pub tools: Vec<ToolDeclaration>,
}

impl SessionContext {
    /// Build the context for a patient from the static stage list and the
    /// fixed tool set.
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            stages: intake_stages()
                .iter()
                .map(|s| StageDescriptor {
                    id: s.id,
                    label: s.display_label,
                    widget: s.widget,
                })
                .collect(),
            tools: declarations(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum BridgeCmd {
    Text(String),
    AudioChunk(Vec<u8>),
    Ack(WidgetType),
    Close,
}

/// Cloneable handle for sending user input to the agent. Sends are FIFO
/// relative to this connection.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCmd>,
}

impl BridgeHandle {
    /// Forward one unit of user text. Returns false if the channel is gone.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(BridgeCmd::Text(text.into())).await.is_ok()
    }

    /// Forward one captured audio chunk without blocking the caller.
    pub fn try_send_audio_chunk(&self, pcm_s16le: Vec<u8>) -> bool {
        self.tx.try_send(BridgeCmd::AudioChunk(pcm_s16le)).is_ok()
    }

    /// Notify the agent that a widget's submission was captured.
    pub async fn acknowledge(&self, widget: WidgetType) -> bool {
        self.tx.send(BridgeCmd::Ack(widget)).await.is_ok()
    }

    /// Tear down the channel. Safe to call multiple times.
    pub async fn close(&self) {
        let _ = self.tx.send(BridgeCmd::Close).await;
    }

    /// A handle with no live channel behind it; every send is a quiet no-op.
    /// Used when the session proceeds without remote agent assistance.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// A handle wired to a bare command queue instead of a live socket.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<BridgeCmd>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }
}

fn should_warn_on_drop(dropped: u64) -> bool {
    // Warn on the first drop, then periodically.
    dropped == 1 || (dropped > 0 && dropped % 50 == 0)
}

/// Establish the channel, declare the session context, and spawn the
/// send/receive tasks. The connect has a hard timeout and is cancellable by
/// dropping the returned future; no audio handle is acquired until the
/// connection is up.
pub async fn open(
    cfg: &BridgeConfig,
    ctx: &SessionContext,
    audio: Arc<AudioSession>,
) -> Result<(BridgeHandle, mpsc::Receiver<AgentEvent>), BridgeError> {
    let mut req = cfg
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| BridgeError::InvalidEndpoint(e.to_string()))?;
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {}", cfg.auth_token.expose_secret())
            .parse()
            .map_err(|_| BridgeError::InvalidEndpoint("invalid auth token header".to_string()))?,
    );

    let (ws, _resp) =
        tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(req))
            .await
            .map_err(|_| BridgeError::ConnectTimeout(cfg.connect_timeout))?
            .map_err(|e| BridgeError::ConnectFailed(e.to_string()))?;

    let (mut ws_write, mut ws_read) = ws.split();

    // Declare stages and tools exactly once, before anything else flows.
    let context_frame = build_session_context_frame(ctx);
    tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(Message::Text(context_frame.into())))
        .await
        .map_err(|_| BridgeError::ConnectFailed("declare session context timed out".to_string()))?
        .map_err(|e| BridgeError::ConnectFailed(format!("declare session context: {e}")))?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<BridgeCmd>(64);
    let (evt_tx, evt_rx) = mpsc::channel::<AgentEvent>(64);

    // Writer task: socket writes never block the read loop. Control frames
    // get their own queue so pongs and acks can't be starved by audio.
    let (out_ctrl_tx, mut out_ctrl_rx) = mpsc::channel::<Message>(32);
    let (out_audio_tx, mut out_audio_rx) = mpsc::channel::<Message>(256);
    tokio::spawn(async move {
        let mut ctrl_closed = false;
        let mut audio_closed = false;
        loop {
            let next: Option<Message> = tokio::select! {
                biased;
                msg = out_ctrl_rx.recv(), if !ctrl_closed => {
                    match msg {
                        Some(m) => Some(m),
                        None => { ctrl_closed = true; None }
                    }
                }
                msg = out_audio_rx.recv(), if !audio_closed => {
                    match msg {
                        Some(m) => Some(m),
                        None => { audio_closed = true; None }
                    }
                }
            };
            let Some(msg) = next else {
                if ctrl_closed && audio_closed {
                    break;
                }
                continue;
            };
            let res = tokio::time::timeout(WS_SEND_TIMEOUT, ws_write.send(msg)).await;
            if !matches!(res, Ok(Ok(()))) {
                break;
            }
        }
        let _ = ws_write.send(Message::Close(None)).await;
    });

    let sample_rate_hz = cfg.sample_rate_hz;
    tokio::spawn(async move {
        let mut dropped_audio_chunks: u64 = 0;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    match cmd {
                        BridgeCmd::Text(text) => {
                            let frame = build_user_text_frame(&text);
                            if out_ctrl_tx.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        BridgeCmd::AudioChunk(pcm) => {
                            let frame = build_user_audio_frame(&pcm, sample_rate_hz);
                            match out_audio_tx.try_send(Message::Text(frame.into())) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    // Drop the chunk rather than stalling reads.
                                    dropped_audio_chunks = dropped_audio_chunks.saturating_add(1);
                                    if should_warn_on_drop(dropped_audio_chunks) {
                                        tracing::warn!(
                                            dropped = dropped_audio_chunks,
                                            "Agent channel backpressure: dropping user audio"
                                        );
                                    }
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => break,
                            }
                        }
                        BridgeCmd::Ack(widget) => {
                            let frame = build_ack_frame(widget);
                            if out_ctrl_tx.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        BridgeCmd::Close => break,
                    }
                }

                msg = ws_read.next() => {
                    let Some(msg) = msg else {
                        fail_channel(&audio, &evt_tx, "connection closed by peer").await;
                        break;
                    };
                    let msg = match msg {
                        Ok(m) => m,
                        Err(e) => {
                            fail_channel(&audio, &evt_tx, &format!("read failed: {e}")).await;
                            break;
                        }
                    };
                    let text = match msg {
                        Message::Text(t) => t.to_string(),
                        Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                        Message::Close(_) => {
                            fail_channel(&audio, &evt_tx, "connection closed by peer").await;
                            break;
                        }
                        Message::Ping(p) => {
                            if out_ctrl_tx.try_send(Message::Pong(p)).is_err() {
                                fail_channel(&audio, &evt_tx, "failed to send pong").await;
                                break;
                            }
                            continue;
                        }
                        _ => continue,
                    };

                    match parse_frame(&text) {
                        Some(AgentFrame::SessionStarted { session_id }) => {
                            let _ = evt_tx.send(AgentEvent::SessionStarted { session_id }).await;
                        }
                        Some(AgentFrame::Speech { text }) => {
                            let _ = evt_tx.send(AgentEvent::Speech { text }).await;
                        }
                        Some(AgentFrame::Audio { pcm }) => {
                            // Straight to the playback queue; never through the session loop.
                            audio.enqueue(pcm);
                        }
                        Some(AgentFrame::ToolCall(call)) => {
                            let _ = evt_tx.send(AgentEvent::ToolCall(call)).await;
                        }
                        Some(AgentFrame::Error { message }) => {
                            fail_channel(&audio, &evt_tx, &message).await;
                            break;
                        }
                        None => {
                            // Unknown or malformed frame; already logged.
                        }
                    }
                }
            }
        }
        audio.release();
        // Dropping evt_tx ends the event stream; dropping the outbound
        // senders ends the writer task, which sends Close.
    });

    Ok((BridgeHandle { tx: cmd_tx }, evt_rx))
}

/// Channel failure: stop in-flight playback, clear the speaking indicator,
/// and emit a terminal event. The session controller is left untouched.
async fn fail_channel(audio: &AudioSession, evt_tx: &mpsc::Sender<AgentEvent>, reason: &str) {
    audio.stop_playback();
    let _ = evt_tx
        .send(AgentEvent::ChannelClosed { reason: reason.to_string() })
        .await;
}

fn build_session_context_frame(ctx: &SessionContext) -> String {
    serde_json::json!({
        "type": "session_context",
        "patient_id": ctx.patient_id,
        "stages": ctx.stages,
        "tools": ctx.tools,
    })
    .to_string()
}

fn build_user_text_frame(text: &str) -> String {
    serde_json::json!({ "type": "user_text", "text": text }).to_string()
}

fn build_user_audio_frame(pcm_s16le: &[u8], sample_rate_hz: u32) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(pcm_s16le);
    serde_json::json!({
        "type": "user_audio_chunk",
        "audio_base_64": b64,
        "sample_rate": sample_rate_hz,
    })
    .to_string()
}

fn build_ack_frame(widget: WidgetType) -> String {
    serde_json::json!({ "type": "widget_submitted", "widget": widget.as_str() }).to_string()
}
