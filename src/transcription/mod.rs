//! Transcription link — the streaming speech-to-text session.
//!
//! The mixer pushes 20 ms PCM frames through [`TranscriptionLink::send_audio`];
//! the remote side answers with VAD and transcript [`LinkEvent`]s on a
//! channel.  [`TranscriptAssembler`] stitches transcript deltas into finished
//! utterances, which become [`TranscriptEntry`]s in the session history.
//!
//! Back ends are chosen once per session through a [`TranscriptionConnector`]
//! built by [`connector_from_config`].

pub mod realtime;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{TranscriptionConfig, TranscriptionProvider};
use crate::transport::SpeakerId;

pub use realtime::RealtimeConnector;

// ---------------------------------------------------------------------------
// LinkEvent / LinkError
// ---------------------------------------------------------------------------

/// Events reported by the remote transcriber.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Remote VAD detected the start of speech.
    SpeechStarted,
    SpeechStopped,
    TranscriptDelta { item_id: String, text: String },
    /// The utterance is final.  `transcript` carries the full text when the
    /// service sends it; otherwise the accumulated deltas are used.
    TranscriptComplete {
        item_id: String,
        transcript: Option<String>,
    },
    /// The service gave up on this item; no completion will follow.
    TranscriptFailed { item_id: String, reason: String },
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("failed to connect transcription link: {0}")]
    Connect(String),

    #[error("transcription link is not connected")]
    NotConnected,

    #[error("transcription link is backlogged, frame dropped")]
    Backlogged,

    #[error("transcription protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Outbound half of a live transcription session.
///
/// All methods are non-blocking; back ends queue work for their own writer.
pub trait TranscriptionLink: Send + Sync {
    /// Queue one frame of link-format PCM (s16le).
    fn send_audio(&self, pcm: Vec<u8>) -> Result<(), LinkError>;

    /// Ask the remote side to finalize the buffered audio.
    fn commit(&self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Close the session.  Calling it again is a no-op.
    fn close(&self);
}

/// A connected link plus its inbound event stream.
pub struct LinkSession {
    pub link: Arc<dyn TranscriptionLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait TranscriptionConnector: Send + Sync {
    async fn connect(&self) -> Result<LinkSession, LinkError>;
}

/// Build the connector for the configured provider.
pub fn connector_from_config(config: &TranscriptionConfig) -> Arc<dyn TranscriptionConnector> {
    match config.provider {
        TranscriptionProvider::OpenAiRealtime => Arc::new(RealtimeConnector::new(config.clone())),
    }
}

// ---------------------------------------------------------------------------
// TranscriptEntry
// ---------------------------------------------------------------------------

/// One finished utterance attributed to a participant.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub speaker_id: SpeakerId,
    pub display_name: String,
    pub text: String,
    pub timestamp: SystemTime,
}

impl TranscriptEntry {
    pub fn new(speaker_id: SpeakerId, display_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            speaker_id,
            display_name: display_name.into(),
            text: text.into(),
            timestamp: SystemTime::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// TranscriptAssembler
// ---------------------------------------------------------------------------

/// Accumulates transcript deltas per item until the item completes.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    partial: HashMap<String, String>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_delta(&mut self, item_id: &str, text: &str) {
        self.partial
            .entry(item_id.to_string())
            .or_default()
            .push_str(text);
    }

    /// Finish `item_id`, preferring the service's final `transcript`.
    ///
    /// Returns `None` when the utterance is blank.
    pub fn complete(&mut self, item_id: &str, transcript: Option<&str>) -> Option<String> {
        let accumulated = self.partial.remove(item_id);
        let text = transcript
            .map(str::to_string)
            .or(accumulated)
            .unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    /// Forget a failed item's deltas.  Returns `true` if any were pending.
    pub fn discard(&mut self, item_id: &str) -> bool {
        self.partial.remove(item_id).is_some()
    }

    /// Number of items still waiting for completion.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
