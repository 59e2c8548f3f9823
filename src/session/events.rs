//! Events posted to a session's event loop.

use std::time::Instant;

use crate::inference::{InferenceError, InferenceReply};
use crate::synthesis::PlaybackOutcome;
use crate::transport::SpeakerId;
use crate::turn::TurnId;

#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Decoded link-format PCM from one speaker's capture task.
    Captured {
        speaker: SpeakerId,
        generation: u64,
        pcm: Vec<i16>,
    },
    /// A capture stream ended or failed.
    CaptureEnded {
        speaker: SpeakerId,
        generation: u64,
        error: Option<String>,
    },
    DebounceElapsed {
        speaker: SpeakerId,
        generation: u64,
    },
    InferenceFinished {
        turn: TurnId,
        result: Result<InferenceReply, InferenceError>,
    },
    AudioStarted {
        turn: TurnId,
        at: Instant,
    },
    SpeechFinished {
        turn: TurnId,
        result: Result<PlaybackOutcome, String>,
    },
    TimeLimitReached,
    GraceElapsed,
    Shutdown {
        reason: String,
    },
}
