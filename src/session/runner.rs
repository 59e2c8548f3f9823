//! Session event loop: drives capture → transcription → inference → speech.
//!
//! [`SessionRunner`] owns every piece of per-session state and is the only
//! code that mutates it.  Transport events, link events, capture packets,
//! timers and task completions all arrive as events; the runner handles
//! them one at a time.
//!
//! # Flow
//!
//! ```text
//! SpeakingStart / SpeakingEnd ─▶ SpeakingLifecycle (subscribe, debounce)
//! mix tick (frame_ms)          ─▶ mixed frame or silent frame ─▶ link
//! TranscriptComplete           ─▶ history ─▶ TurnMachine
//!   └─▶ RunInference ─▶ spawned inference task ─▶ InferenceFinished
//!         └─▶ Speak  ─▶ spawned SpeechPlayer::speak ─▶ SpeechFinished
//! SpeechStarted (link VAD)     ─▶ hard interrupt ─▶ StopPlayback
//! Disconnected / link closed   ─▶ shutdown
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::inference::InferenceClient;
use crate::session::events::SessionEvent;
use crate::session::lifecycle::{ShutdownFlag, TimerSlot};
use crate::session::speaking::SpeakingLifecycle;
use crate::synthesis::{SpeakHooks, SpeakOptions, SpeechPlayer};
use crate::transcription::{LinkEvent, TranscriptAssembler, TranscriptEntry, TranscriptionLink};
use crate::transport::{SpeakerId, TransportEvent, VoiceConnection};
use crate::turn::{ConversationMode, TranscriptHistory, TurnAction, TurnId, TurnMachine, TurnPhase};

/// Captures when playback of one reply starts.
///
/// The hook itself cannot await, so the instant is handed to the speak task,
/// which delivers `AudioStarted` before `SpeechFinished`.
struct TurnHooks {
    turn: TurnId,
    started: Mutex<Option<oneshot::Sender<Instant>>>,
}

impl TurnHooks {
    fn new(turn: TurnId) -> (Self, oneshot::Receiver<Instant>) {
        let (tx, rx) = oneshot::channel();
        let hooks = Self {
            turn,
            started: Mutex::new(Some(tx)),
        };
        (hooks, rx)
    }
}

impl SpeakHooks for TurnHooks {
    fn on_synthesis_start(&self) {
        log::debug!("session: synthesizing turn {}", self.turn);
    }

    fn on_audio_start(&self) {
        let sender = self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(Instant::now());
        }
    }
}

/// Speak one reply, forwarding its audio start and completion to `events`.
async fn speak_turn(
    player: Arc<SpeechPlayer>,
    turn: TurnId,
    text: String,
    events: mpsc::Sender<SessionEvent>,
) {
    let (hooks, started) = TurnHooks::new(turn);
    let speak = async {
        let result = player
            .speak(&text, SpeakOptions::default(), &hooks)
            .await
            .map_err(|e| e.to_string());
        // Releases the start sender if audio never began.
        drop(hooks);
        result
    };
    let report_start = async {
        if let Ok(at) = started.await {
            let _ = events.send(SessionEvent::AudioStarted { turn, at }).await;
        }
    };

    let (result, ()) = tokio::join!(speak, report_start);
    let _ = events.send(SessionEvent::SpeechFinished { turn, result }).await;
}

pub(crate) struct SessionRunner {
    pub(crate) flag: ShutdownFlag,
    pub(crate) connection: Option<Arc<dyn VoiceConnection>>,
    pub(crate) link: Option<Arc<dyn TranscriptionLink>>,
    pub(crate) transport_events: mpsc::Receiver<TransportEvent>,
    pub(crate) link_events: mpsc::Receiver<LinkEvent>,
    pub(crate) events_tx: mpsc::Sender<SessionEvent>,
    pub(crate) events_rx: mpsc::Receiver<SessionEvent>,
    pub(crate) speaking: SpeakingLifecycle,
    pub(crate) turns: TurnMachine,
    pub(crate) mode: Box<dyn ConversationMode>,
    pub(crate) history: TranscriptHistory,
    pub(crate) assembler: TranscriptAssembler,
    pub(crate) inference: Arc<dyn InferenceClient>,
    pub(crate) player: Arc<SpeechPlayer>,
    pub(crate) frame: Duration,
    pub(crate) announcement: Option<String>,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) grace: Duration,
    pub(crate) phase_tx: watch::Sender<TurnPhase>,
    pub(crate) closed_tx: watch::Sender<Option<String>>,
    pub(crate) inference_task: Option<JoinHandle<()>>,
    pub(crate) speech_task: Option<JoinHandle<()>>,
    pub(crate) limit_timer: TimerSlot,
    pub(crate) grace_timer: TimerSlot,
    pub(crate) limit_reached: bool,
    pub(crate) utterance_speaker: Option<SpeakerId>,
}

impl SessionRunner {
    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run until the session shuts down.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.frame);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if let Some(limit) = self.time_limit {
            self.limit_timer
                .schedule(limit, &self.events_tx, |_| SessionEvent::TimeLimitReached);
        }

        while !self.flag.is_set() {
            tokio::select! {
                event = self.transport_events.recv() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => self.shutdown("voice transport closed").await,
                },
                event = self.link_events.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => self.shutdown("transcription link closed").await,
                },
                Some(event) = self.events_rx.recv() => self.on_session_event(event).await,
                _ = ticker.tick() => self.on_tick(),
            }
            if !self.flag.is_set() {
                self.phase_tx.send_replace(self.turns.phase());
            }
        }
        log::debug!("session: event loop finished");
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                log::info!("session: voice connection ready");
                if let Some(text) = self.announcement.take() {
                    let actions = self.turns.begin_announcement(&text);
                    self.apply(actions).await;
                }
            }
            TransportEvent::SpeakingStart(id) => {
                if let Some(connection) = self.connection.clone() {
                    self.speaking.on_speaking_start(&id, connection.as_ref());
                }
            }
            TransportEvent::SpeakingEnd(id) => self.speaking.on_speaking_end(&id),
            TransportEvent::Disconnected => self.shutdown("voice connection lost").await,
            TransportEvent::Destroyed => self.shutdown("voice connection destroyed").await,
            TransportEvent::Error(e) => self.shutdown(&format!("voice transport error: {e}")).await,
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::SpeechStarted => {
                self.utterance_speaker = self.speaking.primary_speaker().cloned();
                let actions = self.turns.on_hard_interrupt();
                self.apply(actions).await;
            }
            LinkEvent::SpeechStopped => log::debug!("session: link detected end of speech"),
            LinkEvent::TranscriptDelta { item_id, text } => {
                self.assembler.push_delta(&item_id, &text);
            }
            LinkEvent::TranscriptComplete { item_id, transcript } => {
                if let Some(text) = self.assembler.complete(&item_id, transcript.as_deref()) {
                    self.on_transcript(text).await;
                }
            }
            LinkEvent::TranscriptFailed { item_id, reason } => {
                self.assembler.discard(&item_id);
                log::warn!("session: transcription of {item_id} failed: {reason}");
            }
            LinkEvent::Closed => self.shutdown("transcription link closed").await,
            LinkEvent::Error(e) => self.shutdown(&format!("transcription link error: {e}")).await,
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Captured {
                speaker,
                generation,
                pcm,
            } => self.speaking.on_captured(&speaker, generation, &pcm),
            SessionEvent::CaptureEnded {
                speaker,
                generation,
                error,
            } => self
                .speaking
                .on_capture_ended(&speaker, generation, error.as_deref()),
            SessionEvent::DebounceElapsed { speaker, generation } => {
                self.speaking.on_debounce_elapsed(&speaker, generation)
            }
            SessionEvent::InferenceFinished { turn, result } => {
                if turn == self.turns.current_turn() {
                    self.inference_task = None;
                }
                let actions = self
                    .turns
                    .on_inference_finished(turn, result, self.mode.as_ref());
                self.apply(actions).await;
                self.leave_if_over_time().await;
            }
            SessionEvent::AudioStarted { turn, at } => self.turns.on_audio_started(turn, at),
            SessionEvent::SpeechFinished { turn, result } => {
                if let Err(e) = result {
                    log::warn!("session: reply for turn {turn} failed: {e}");
                }
                let actions = self.turns.on_speech_finished(turn);
                self.apply(actions).await;
                self.leave_if_over_time().await;
            }
            SessionEvent::TimeLimitReached => {
                self.limit_reached = true;
                if self.turns.is_idle() {
                    self.shutdown("time limit reached").await;
                } else {
                    log::info!("session: time limit reached, finishing current turn");
                    self.grace_timer
                        .schedule(self.grace, &self.events_tx, |_| SessionEvent::GraceElapsed);
                }
            }
            SessionEvent::GraceElapsed => self.shutdown("time limit reached").await,
            SessionEvent::Shutdown { reason } => self.shutdown(&reason).await,
        }
    }

    fn on_tick(&mut self) {
        if let Some(link) = &self.link {
            self.speaking.tick(link.as_ref(), Instant::now());
        }
    }

    async fn on_transcript(&mut self, text: String) {
        let speaker = self
            .utterance_speaker
            .take()
            .or_else(|| self.speaking.primary_speaker().cloned())
            .unwrap_or_else(|| SpeakerId::from("unknown"));
        let display_name = self
            .connection
            .as_ref()
            .and_then(|c| c.display_name(&speaker))
            .unwrap_or_else(|| speaker.to_string());
        let entry = TranscriptEntry::new(speaker, display_name, text);
        log::info!("session: {}: {}", entry.display_name, entry.text);

        self.history.push(entry.clone());
        self.inference.record_transcript(&entry);
        let triggered = self.mode.should_trigger(&entry);
        let actions = self
            .turns
            .on_transcript(&entry, triggered, &self.history, Instant::now());
        self.apply(actions).await;
    }

    async fn leave_if_over_time(&mut self) {
        if self.limit_reached && self.turns.is_idle() {
            self.shutdown("time limit reached").await;
        }
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    async fn apply(&mut self, actions: Vec<TurnAction>) {
        for action in actions {
            if self.flag.is_set() {
                return;
            }
            match action {
                TurnAction::RunInference { turn, context } => {
                    if let Some(task) = self.inference_task.take() {
                        task.abort();
                    }
                    let inference = Arc::clone(&self.inference);
                    let events = self.events_tx.clone();
                    self.inference_task = Some(tokio::spawn(async move {
                        let result = inference.run_inference(context).await;
                        let _ = events.send(SessionEvent::InferenceFinished { turn, result }).await;
                    }));
                }
                TurnAction::Speak {
                    turn,
                    text,
                    interruptible,
                } => {
                    log::debug!("session: speaking turn {turn} (interruptible: {interruptible})");
                    self.speech_task = Some(tokio::spawn(speak_turn(
                        Arc::clone(&self.player),
                        turn,
                        text,
                        self.events_tx.clone(),
                    )));
                }
                TurnAction::StopPlayback { reason } => {
                    self.player.stop(reason).await;
                }
                TurnAction::Disconnect { reason } => self.shutdown(reason).await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Release everything, in order, exactly once.
    async fn shutdown(&mut self, reason: &str) {
        if !self.flag.begin() {
            return;
        }
        log::info!("session: shutting down ({reason})");

        self.speaking.detach_all();
        self.limit_timer.cancel();
        self.grace_timer.cancel();
        if let Some(task) = self.inference_task.take() {
            task.abort();
        }

        self.player.stop("session ending").await;
        if let Some(task) = self.speech_task.take() {
            // A reply that had not claimed the player yet.
            task.abort();
            let _ = task.await;
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(connection) = self.connection.take() {
            connection.destroy();
        }

        self.phase_tx.send_replace(TurnPhase::Idle);
        self.closed_tx.send_replace(Some(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::RawPcmCodec;
    use crate::config::TranscoderConfig;
    use crate::synthesis::PipelineSettings;
    use crate::testing::{init_logging, FakeConnection, FakeSynthesizer};

    fn player(synth: FakeSynthesizer) -> Arc<SpeechPlayer> {
        let settings = PipelineSettings {
            transcoder: TranscoderConfig {
                program: "cat".into(),
                args: Vec::new(),
            },
            frame_bytes: 64,
            buffer_frames: 4,
        };
        Arc::new(SpeechPlayer::new(
            Arc::new(FakeConnection::new()) as Arc<dyn VoiceConnection>,
            Arc::new(synth),
            Arc::new(RawPcmCodec::default()),
            settings,
        ))
    }

    #[tokio::test]
    async fn audio_start_survives_a_full_queue() {
        init_logging();
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(SessionEvent::GraceElapsed).await.expect("queue open");

        let task = tokio::spawn(speak_turn(player(FakeSynthesizer::new(3, 64)), 7, "hi".into(), tx));

        assert!(matches!(rx.recv().await, Some(SessionEvent::GraceElapsed)));
        assert!(matches!(rx.recv().await, Some(SessionEvent::AudioStarted { turn: 7, .. })));
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::SpeechFinished { turn: 7, result: Ok(_) })
        ));
        task.await.expect("speak task");
    }

    #[tokio::test]
    async fn reply_without_audio_only_reports_finish() {
        init_logging();
        let (tx, mut rx) = mpsc::channel(4);

        speak_turn(player(FakeSynthesizer::failing()), 3, "hi".into(), tx).await;

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::SpeechFinished { turn: 3, result: Err(_) })
        ));
        assert!(rx.recv().await.is_none());
    }
}
