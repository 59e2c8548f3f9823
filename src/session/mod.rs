//! Voice sessions: one bot presence in one voice channel.
//!
//! [`start_session`] joins the channel, opens the transcription link and
//! spawns the event loop.  The returned [`SessionHandle`] observes the turn
//! phase and ends the session; [`SessionHandle::cleanup`] may be called any
//! number of times from anywhere and tears everything down exactly once.

pub mod lifecycle;
pub(crate) mod events;
pub(crate) mod runner;
pub(crate) mod speaking;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::audio::codec::CodecFactory;
use crate::config::{BridgeConfig, TriggerMode};
use crate::inference::InferenceClient;
use crate::synthesis::{PipelineSettings, SpeechPlayer, SpeechSynthesizer};
use crate::transcription::{LinkError, TranscriptAssembler, TranscriptionConnector};
use crate::transport::{TransportError, TransportTarget, VoiceTransport};
use crate::turn::{mode_from_config, TranscriptHistory, TurnMachine, TurnPhase, TurnSettings};

pub use lifecycle::{ShutdownFlag, TimerSlot};

use events::SessionEvent;
use runner::SessionRunner;
use speaking::SpeakingLifecycle;

const EVENT_QUEUE: usize = 1024;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn VoiceTransport>,
    pub transcription: Arc<dyn TranscriptionConnector>,
    pub inference: Arc<dyn InferenceClient>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub codec: Arc<dyn CodecFactory>,
}

/// Per-session behaviour, usually taken from [`BridgeConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub prevent_interruptions: bool,
    pub trigger: TriggerMode,
    /// Spoken once when the connection becomes ready.
    pub announcement: Option<String>,
    /// Leave after this long (plus a grace period if a turn is in progress).
    pub time_limit: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            prevent_interruptions: config.turn.prevent_interruptions,
            trigger: config.turn.trigger.clone(),
            announcement: config
                .session
                .announcement
                .as_ref()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            time_limit: config.session.time_limit_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("transcription link unavailable: {0}")]
    Link(#[from] LinkError),
}

// ---------------------------------------------------------------------------
// start_session
// ---------------------------------------------------------------------------

/// Join `target` and start conversing.
///
/// Nothing is left behind on failure: if the transcription link cannot be
/// opened the freshly joined connection is destroyed again.
pub async fn start_session(
    deps: SessionDeps,
    target: &TransportTarget,
    options: SessionOptions,
    config: &BridgeConfig,
) -> Result<SessionHandle, SessionError> {
    let joined = deps.transport.join(target).await?;
    log::info!("session: joined {target}");

    let link = match deps.transcription.connect().await {
        Ok(link) => link,
        Err(e) => {
            log::error!("session: transcription link failed, leaving {target}: {e}");
            joined.connection.destroy();
            return Err(e.into());
        }
    };

    let flag = ShutdownFlag::new();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (phase_tx, phase_rx) = watch::channel(TurnPhase::Idle);
    let (closed_tx, closed_rx) = watch::channel(None);

    let speaking = SpeakingLifecycle::new(
        &config.audio,
        &config.speaking,
        Arc::clone(&deps.codec),
        events_tx.clone(),
        flag.clone(),
    );
    let player = Arc::new(SpeechPlayer::new(
        Arc::clone(&joined.connection),
        deps.synthesizer,
        deps.codec,
        PipelineSettings::from_config(config),
    ));
    let settings = TurnSettings {
        prevent_interruptions: options.prevent_interruptions,
        ..TurnSettings::from_config(&config.turn)
    };

    let runner = SessionRunner {
        flag: flag.clone(),
        connection: Some(joined.connection),
        link: Some(link.link),
        transport_events: joined.events,
        link_events: link.events,
        events_tx: events_tx.clone(),
        events_rx,
        speaking,
        turns: TurnMachine::new(settings),
        mode: mode_from_config(&options.trigger, &config.turn),
        history: TranscriptHistory::new(config.turn.history_cap),
        assembler: TranscriptAssembler::new(),
        inference: deps.inference,
        player,
        frame: Duration::from_millis(u64::from(config.audio.cadence_ms())),
        announcement: options.announcement,
        time_limit: options.time_limit,
        grace: Duration::from_secs(config.session.time_limit_grace_secs),
        phase_tx,
        closed_tx,
        inference_task: None,
        speech_task: None,
        limit_timer: TimerSlot::new(),
        grace_timer: TimerSlot::new(),
        limit_reached: false,
        utterance_speaker: None,
    };
    tokio::spawn(runner.run());

    Ok(SessionHandle {
        events: events_tx,
        flag,
        phase: phase_rx,
        closed: closed_rx,
    })
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable view of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    flag: ShutdownFlag,
    phase: watch::Receiver<TurnPhase>,
    closed: watch::Receiver<Option<String>>,
}

impl SessionHandle {
    /// End the session and wait until every resource is released.
    ///
    /// Returns the reason the session actually ended with, which is the
    /// first caller's reason when several callers race.
    pub async fn cleanup(&self, reason: &str) -> String {
        let _ = self
            .events
            .send(SessionEvent::Shutdown {
                reason: reason.to_string(),
            })
            .await;
        self.closed().await
    }

    /// Wait until the session has ended.
    pub async fn closed(&self) -> String {
        let mut closed = self.closed.clone();
        closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone())
            .unwrap_or_else(|| "session ended".to_string())
    }

    pub fn phase(&self) -> TurnPhase {
        *self.phase.borrow()
    }

    /// `true` from the moment teardown begins.
    pub fn is_shutting_down(&self) -> bool {
        self.flag.is_set()
    }

    /// `true` once teardown has finished.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }
}

#[cfg(test)]
mod tests;
