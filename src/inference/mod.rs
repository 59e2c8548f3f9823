//! Conversational inference — decides what the bridge says back.
//!
//! * [`InferenceClient`] — async trait the session drives once per turn.
//! * [`ChatCompletionsClient`] — OpenAI-compatible chat-completions back end.
//! * [`ConversationWindow`] — rolling window of transcript lines and replies.
//! * [`InferenceError`] — error variants for inference calls.

pub mod chat;
pub mod window;

use async_trait::async_trait;
use thiserror::Error;

use crate::transcription::TranscriptEntry;

pub use chat::{parse_reply, ChatCompletionsClient, END_SESSION_MARKER};
pub use window::{ConversationWindow, Role, WindowMessage};

// ---------------------------------------------------------------------------
// InferenceError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum InferenceError {
    /// HTTP transport, connection or status error.
    #[error("inference request failed: {0}")]
    Request(String),

    #[error("inference request timed out")]
    Timeout,

    #[error("failed to parse inference response: {0}")]
    Parse(String),

    #[error("inference returned an empty response")]
    EmptyResponse,
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Context / reply
// ---------------------------------------------------------------------------

/// What a turn hands to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceContext {
    /// The transcript that started the turn.
    pub trigger: TranscriptEntry,
    /// Session history at the moment the turn started, oldest first.
    pub history: Vec<TranscriptEntry>,
}

/// The model's answer for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceReply {
    /// Text to speak, if any.
    pub spoken_text: Option<String>,
    /// The model asked to leave the call once the reply has been spoken.
    pub end_session: bool,
}

impl InferenceReply {
    pub fn speak(text: impl Into<String>) -> Self {
        Self {
            spoken_text: Some(text.into()),
            end_session: false,
        }
    }

    /// Trimmed reply text, or `None` when there is nothing worth saying.
    pub fn usable_text(&self) -> Option<&str> {
        self.spoken_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

// ---------------------------------------------------------------------------
// InferenceClient trait
// ---------------------------------------------------------------------------

/// Conversational model used by a session.
///
/// Implementors must be `Send + Sync`; the session shares one instance
/// between its event loop and its inference tasks.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Note a finalized transcript, whether or not it starts a turn.
    fn record_transcript(&self, entry: &TranscriptEntry);

    async fn run_inference(&self, context: InferenceContext)
        -> Result<InferenceReply, InferenceError>;
}
