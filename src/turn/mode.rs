//! Conversation modes: when to answer, and what to do when answering fails.

use crate::config::{TriggerMode, TurnConfig};
use crate::inference::InferenceError;
use crate::transcription::TranscriptEntry;

/// What a session does after an inference call fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    /// Spoken without allowing interruption.
    pub apology: Option<String>,
    /// Leave the call afterwards (after the apology, if any).
    pub disconnect: bool,
}

impl FailurePolicy {
    pub fn silent() -> Self {
        Self {
            apology: None,
            disconnect: false,
        }
    }

    pub fn from_config(config: &TurnConfig) -> Self {
        let apology = config.apology_message.trim();
        Self {
            apology: (!apology.is_empty()).then(|| apology.to_string()),
            disconnect: config.disconnect_on_inference_failure,
        }
    }
}

pub trait ConversationMode: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a finalized transcript starts a turn.
    fn should_trigger(&self, entry: &TranscriptEntry) -> bool;

    fn on_inference_error(&self, error: &InferenceError) -> FailurePolicy;
}

/// Answers every transcript.
pub struct AlwaysRespond {
    failure: FailurePolicy,
}

impl AlwaysRespond {
    pub fn new(failure: FailurePolicy) -> Self {
        Self { failure }
    }
}

impl ConversationMode for AlwaysRespond {
    fn name(&self) -> &'static str {
        "always"
    }

    fn should_trigger(&self, _entry: &TranscriptEntry) -> bool {
        true
    }

    fn on_inference_error(&self, _error: &InferenceError) -> FailurePolicy {
        self.failure.clone()
    }
}

/// Answers only transcripts that mention a wake phrase.
pub struct WakePhrase {
    phrases: Vec<String>,
    failure: FailurePolicy,
}

impl WakePhrase {
    pub fn new(phrases: &[String], failure: FailurePolicy) -> Self {
        let phrases = phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases, failure }
    }
}

impl ConversationMode for WakePhrase {
    fn name(&self) -> &'static str {
        "wake_phrase"
    }

    fn should_trigger(&self, entry: &TranscriptEntry) -> bool {
        let text = entry.text.to_lowercase();
        self.phrases.iter().any(|p| text.contains(p.as_str()))
    }

    fn on_inference_error(&self, _error: &InferenceError) -> FailurePolicy {
        self.failure.clone()
    }
}

pub fn mode_from_config(trigger: &TriggerMode, turn: &TurnConfig) -> Box<dyn ConversationMode> {
    let failure = FailurePolicy::from_config(turn);
    match trigger {
        TriggerMode::Always => Box::new(AlwaysRespond::new(failure)),
        TriggerMode::WakePhrase { phrases } => Box::new(WakePhrase::new(phrases, failure)),
    }
}
