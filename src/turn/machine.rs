//! Turn state machine.
//!
//! Pure and synchronous: the session's event loop feeds it events and carries
//! out the [`TurnAction`]s it returns.  Every asynchronous completion is
//! tagged with the [`TurnId`] it was started for; completions for any other
//! turn are ignored.
//!
//! ```text
//! Idle ──triggered transcript──▶ Thinking ──reply with text──▶ Speaking
//!   ▲                              │  no usable reply / error       │
//!   └──────────────────────────────┘◀────── playback finished ──────┘
//! Speaking ──triggered transcript, window elapsed──▶ Thinking
//! Speaking ──remote VAD speech start──▶ Idle
//! ```

use std::time::{Duration, Instant};

use crate::config::TurnConfig;
use crate::inference::{InferenceContext, InferenceError, InferenceReply};
use crate::transcription::TranscriptEntry;
use crate::turn::history::TranscriptHistory;
use crate::turn::mode::ConversationMode;

pub type TurnId = u64;

// ---------------------------------------------------------------------------
// TurnPhase / TurnState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    #[default]
    Idle,
    /// Inference is running.
    Thinking,
    /// A reply is being synthesized or played.
    Speaking,
}

impl TurnPhase {
    pub fn label(&self) -> &'static str {
        match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Thinking => "thinking",
            TurnPhase::Speaking => "speaking",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnState {
    pub phase: TurnPhase,
    /// When the current reply's first audio reached the player.
    pub speech_started_at: Option<Instant>,
    /// Context of the inference call in flight.
    pub pending_context: Option<InferenceContext>,
    /// An inference call is in flight.
    pub is_running: bool,
}

/// Work the event loop must carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    RunInference {
        turn: TurnId,
        context: InferenceContext,
    },
    Speak {
        turn: TurnId,
        text: String,
        interruptible: bool,
    },
    StopPlayback {
        reason: &'static str,
    },
    Disconnect {
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettings {
    /// Minimum playback time before a transcript may interrupt.
    pub interrupt_window: Duration,
    pub prevent_interruptions: bool,
}

impl TurnSettings {
    pub fn from_config(config: &TurnConfig) -> Self {
        Self {
            interrupt_window: Duration::from_millis(config.interrupt_window_ms),
            prevent_interruptions: config.prevent_interruptions,
        }
    }
}

// ---------------------------------------------------------------------------
// TurnMachine
// ---------------------------------------------------------------------------

pub struct TurnMachine {
    settings: TurnSettings,
    state: TurnState,
    current: TurnId,
    last_issued: TurnId,
    /// The current utterance may be cut short.
    interruptible: bool,
    /// Leave the call once the current utterance finishes.
    disconnect_after_speech: Option<&'static str>,
}

impl TurnMachine {
    pub fn new(settings: TurnSettings) -> Self {
        Self {
            settings,
            state: TurnState::default(),
            current: 0,
            last_issued: 0,
            interruptible: true,
            disconnect_after_speech: None,
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.state.phase
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn current_turn(&self) -> TurnId {
        self.current
    }

    pub fn is_idle(&self) -> bool {
        self.state.phase == TurnPhase::Idle
    }

    /// A finalized transcript arrived.  `history` already contains `entry`.
    pub fn on_transcript(
        &mut self,
        entry: &TranscriptEntry,
        triggered: bool,
        history: &TranscriptHistory,
        now: Instant,
    ) -> Vec<TurnAction> {
        if !triggered {
            return Vec::new();
        }

        match self.state.phase {
            TurnPhase::Idle => vec![self.start_thinking(entry, history)],
            TurnPhase::Thinking => {
                log::debug!("turn: already thinking, transcript merged into history");
                Vec::new()
            }
            TurnPhase::Speaking => {
                if !self.interruption_permitted(now) {
                    log::debug!("turn: speaking, interruption not permitted yet");
                    return Vec::new();
                }
                log::info!("turn: reply interrupted by {}", entry.display_name);
                vec![
                    TurnAction::StopPlayback {
                        reason: "interrupted by participant",
                    },
                    self.start_thinking(entry, history),
                ]
            }
        }
    }

    /// The inference call for `turn` finished.
    pub fn on_inference_finished(
        &mut self,
        turn: TurnId,
        result: Result<InferenceReply, InferenceError>,
        mode: &dyn ConversationMode,
    ) -> Vec<TurnAction> {
        if turn != self.current || self.state.phase != TurnPhase::Thinking {
            log::debug!("turn: ignoring stale inference result for turn {turn}");
            return Vec::new();
        }
        self.state.is_running = false;
        self.state.pending_context = None;
        self.state.phase = TurnPhase::Idle;

        match result {
            Ok(reply) => {
                let end = reply.end_session.then_some("conversation ended by assistant");
                match reply.usable_text() {
                    Some(text) => {
                        let text = text.to_string();
                        self.disconnect_after_speech = end;
                        vec![self.start_speaking(text, true)]
                    }
                    None => {
                        log::debug!("turn: no usable reply");
                        end.map(|reason| TurnAction::Disconnect { reason })
                            .into_iter()
                            .collect()
                    }
                }
            }
            Err(e) => {
                log::warn!("turn: inference failed: {e}");
                let policy = mode.on_inference_error(&e);
                let end = policy.disconnect.then_some("inference failed");
                match policy.apology {
                    Some(apology) => {
                        self.disconnect_after_speech = end;
                        vec![self.start_speaking(apology, false)]
                    }
                    None => end
                        .map(|reason| TurnAction::Disconnect { reason })
                        .into_iter()
                        .collect(),
                }
            }
        }
    }

    /// The first audio of `turn`'s utterance reached the player.
    pub fn on_audio_started(&mut self, turn: TurnId, now: Instant) {
        if turn == self.current && self.state.phase == TurnPhase::Speaking {
            self.state.speech_started_at = Some(now);
        }
    }

    /// `turn`'s utterance ended (played out, stopped or failed).
    pub fn on_speech_finished(&mut self, turn: TurnId) -> Vec<TurnAction> {
        if turn != self.current || self.state.phase != TurnPhase::Speaking {
            return Vec::new();
        }
        self.state.phase = TurnPhase::Idle;
        self.state.speech_started_at = None;
        self.disconnect_after_speech
            .take()
            .map(|reason| TurnAction::Disconnect { reason })
            .into_iter()
            .collect()
    }

    /// Remote VAD heard speech.  Cuts the reply regardless of the window.
    pub fn on_hard_interrupt(&mut self) -> Vec<TurnAction> {
        if self.settings.prevent_interruptions
            || !self.interruptible
            || self.state.phase != TurnPhase::Speaking
        {
            return Vec::new();
        }

        // Orphan the utterance so its completion is ignored.
        self.current = self.issue_turn();
        self.state.phase = TurnPhase::Idle;
        self.state.speech_started_at = None;

        let mut actions = vec![TurnAction::StopPlayback {
            reason: "speech detected",
        }];
        if let Some(reason) = self.disconnect_after_speech.take() {
            actions.push(TurnAction::Disconnect { reason });
        }
        actions
    }

    /// Speak `text` outside any conversational turn.  Only from idle.
    pub fn begin_announcement(&mut self, text: &str) -> Vec<TurnAction> {
        let text = text.trim();
        if self.state.phase != TurnPhase::Idle || text.is_empty() {
            return Vec::new();
        }
        vec![self.start_speaking(text.to_string(), true)]
    }

    /// Whether a triggered transcript may cut the current reply short.
    pub fn interruption_permitted(&self, now: Instant) -> bool {
        if self.settings.prevent_interruptions
            || !self.interruptible
            || self.state.phase != TurnPhase::Speaking
        {
            return false;
        }
        self.state
            .speech_started_at
            .is_some_and(|started| now.saturating_duration_since(started) >= self.settings.interrupt_window)
    }

    fn issue_turn(&mut self) -> TurnId {
        self.last_issued += 1;
        self.last_issued
    }

    fn start_thinking(&mut self, entry: &TranscriptEntry, history: &TranscriptHistory) -> TurnAction {
        let turn = self.issue_turn();
        let context = InferenceContext {
            trigger: entry.clone(),
            history: history.snapshot(),
        };
        self.current = turn;
        self.interruptible = true;
        self.disconnect_after_speech = None;
        self.state = TurnState {
            phase: TurnPhase::Thinking,
            speech_started_at: None,
            pending_context: Some(context.clone()),
            is_running: true,
        };
        log::debug!("turn: {turn} thinking");
        TurnAction::RunInference { turn, context }
    }

    fn start_speaking(&mut self, text: String, interruptible: bool) -> TurnAction {
        let turn = self.issue_turn();
        self.current = turn;
        self.interruptible = interruptible;
        self.state.phase = TurnPhase::Speaking;
        self.state.speech_started_at = None;
        log::debug!("turn: {turn} speaking");
        TurnAction::Speak {
            turn,
            text,
            interruptible,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
