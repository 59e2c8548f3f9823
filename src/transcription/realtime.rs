//! OpenAI realtime transcription over a websocket.
//!
//! One connection per session.  Outbound audio is queued from the session's
//! event loop and written by a dedicated writer task as base64
//! `input_audio_buffer.append` messages; a reader task turns server events
//! into [`LinkEvent`]s.
//!
//! The outbound queue holds about one second of frames.  When the socket
//! cannot keep up, further frames are refused with [`LinkError::Backlogged`]
//! and the caller drops them.  A failed write is reported as
//! [`LinkEvent::Error`] on the same channel the reader uses.
//!
//! ```text
//! send_audio ──▶ outbound queue (bounded) ──▶ writer task ──▶ ws sink
//! ws stream ──▶ reader task ──parse_server_event──▶ LinkEvent channel
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{resolve_api_key, TranscriptionConfig};
use crate::transcription::{
    LinkError, LinkEvent, LinkSession, TranscriptionConnector, TranscriptionLink,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// 50 frames of 20 ms.
const OUTBOUND_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// Server event parsing
// ---------------------------------------------------------------------------

/// Map one server JSON message to a [`LinkEvent`].
///
/// Returns `None` for messages the bridge does not act on (session
/// acknowledgements, rate-limit updates, commits).
pub fn parse_server_event(text: &str) -> Option<LinkEvent> {
    let json: serde_json::Value = serde_json::from_str(text).ok()?;
    let item_id = || json["item_id"].as_str().unwrap_or_default().to_string();

    match json["type"].as_str()? {
        "input_audio_buffer.speech_started" => Some(LinkEvent::SpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(LinkEvent::SpeechStopped),
        "conversation.item.input_audio_transcription.delta" => Some(LinkEvent::TranscriptDelta {
            item_id: item_id(),
            text: json["delta"].as_str().unwrap_or_default().to_string(),
        }),
        "conversation.item.input_audio_transcription.completed" => {
            Some(LinkEvent::TranscriptComplete {
                item_id: item_id(),
                transcript: json["transcript"].as_str().map(str::to_string),
            })
        }
        "conversation.item.input_audio_transcription.failed" => Some(LinkEvent::TranscriptFailed {
            item_id: item_id(),
            reason: json["error"]["message"]
                .as_str()
                .unwrap_or("transcription failed")
                .to_string(),
        }),
        "error" => {
            let message = json["error"]["message"]
                .as_str()
                .unwrap_or("unknown transcription error");
            Some(LinkEvent::Error(message.to_string()))
        }
        _ => None,
    }
}

fn session_update(config: &TranscriptionConfig) -> serde_json::Value {
    let mut transcription = serde_json::json!({ "model": config.model });
    if let Some(language) = config.language.as_deref().filter(|l| !l.is_empty()) {
        transcription["language"] = serde_json::Value::from(language);
    }

    serde_json::json!({
        "type": "transcription_session.update",
        "session": {
            "input_audio_format": "pcm16",
            "input_audio_transcription": transcription,
            "turn_detection": {
                "type": "server_vad",
                "threshold": config.vad_threshold,
                "prefix_padding_ms": config.vad_prefix_padding_ms,
                "silence_duration_ms": config.vad_silence_duration_ms
            }
        }
    })
}

// ---------------------------------------------------------------------------
// RealtimeTranscriptionLink
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Outbound {
    Audio(Vec<u8>),
    Commit,
}

impl Outbound {
    fn to_message(&self) -> Message {
        let payload = match self {
            Outbound::Audio(pcm) => serde_json::json!({
                "type": "input_audio_buffer.append",
                "audio": BASE64.encode(pcm)
            }),
            Outbound::Commit => serde_json::json!({ "type": "input_audio_buffer.commit" }),
        };
        Message::Text(payload.to_string())
    }
}

/// Outbound half of a realtime transcription websocket.
pub struct RealtimeTranscriptionLink {
    outbound: mpsc::Sender<Outbound>,
    close_tx: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl RealtimeTranscriptionLink {
    fn new(outbound: mpsc::Sender<Outbound>, close_tx: watch::Sender<bool>, connected: Arc<AtomicBool>) -> Self {
        Self {
            outbound,
            close_tx,
            connected,
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self, msg: Outbound) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => LinkError::NotConnected,
        })
    }
}

impl TranscriptionLink for RealtimeTranscriptionLink {
    fn send_audio(&self, pcm: Vec<u8>) -> Result<(), LinkError> {
        self.queue(Outbound::Audio(pcm))
    }

    fn commit(&self) -> Result<(), LinkError> {
        self.queue(Outbound::Commit)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.close_tx.send_replace(true);
        log::info!("transcription: link closed");
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain `outbound` into `sink` until the link is closed or a write fails.
///
/// A failed write on a link nobody closed is posted as [`LinkEvent::Error`].
async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Outbound>,
    mut close_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<LinkEvent>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let msg = tokio::select! {
            biased;
            // Also fires when the link handle is dropped.
            _ = close_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        if let Err(e) = sink.send(msg.to_message()).await {
            if connected.swap(false, Ordering::AcqRel) {
                log::warn!("transcription: send failed: {e}");
                let _ = events.send(LinkEvent::Error(format!("send failed: {e}"))).await;
            }
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// RealtimeConnector
// ---------------------------------------------------------------------------

/// Opens [`RealtimeTranscriptionLink`]s from [`TranscriptionConfig`].
pub struct RealtimeConnector {
    config: TranscriptionConfig,
}

impl RealtimeConnector {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TranscriptionConnector for RealtimeConnector {
    async fn connect(&self) -> Result<LinkSession, LinkError> {
        let api_key = resolve_api_key(self.config.api_key.as_deref(), "OPENAI_API_KEY")
            .ok_or_else(|| LinkError::Connect("no API key configured".into()))?;

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(session_update(&self.config).to_string()))
            .await
            .map_err(|e| LinkError::Connect(e.to_string()))?;

        log::info!(
            "transcription: connected to {} (model {})",
            self.config.url,
            self.config.model
        );

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_writer(
            sink,
            outbound_rx,
            close_rx,
            Arc::clone(&connected),
            events_tx.clone(),
        ));

        // Reader
        let reader_connected = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(event) = parse_server_event(&text) else {
                            continue;
                        };
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx.send(LinkEvent::Error(e.to_string())).await;
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::Release);
            let _ = events_tx.send(LinkEvent::Closed).await;
        });

        let link = RealtimeTranscriptionLink::new(outbound_tx, close_tx, connected);

        Ok(LinkSession {
            link: Arc::new(link),
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
