//! `SpeechPlayer` — speaks one utterance at a time on a voice connection.
//!
//! A call to [`SpeechPlayer::speak`] claims the player's single active slot
//! for its whole lifetime.  [`SpeechPlayer::stop`] signals the slot's owner
//! and waits until it has released every resource, so once `stop` returns
//! nothing from the old utterance is still running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::watch;

use crate::audio::codec::CodecFactory;
use crate::synthesis::pipeline::{AudioPipeline, PipelineSettings};
use crate::synthesis::{AudioByteStream, SpeechSynthesizer, SynthesisError, SynthesisOptions};
use crate::transport::VoiceConnection;

// ---------------------------------------------------------------------------
// Options / hooks / outcome
// ---------------------------------------------------------------------------

/// Progress callbacks for one utterance.
pub trait SpeakHooks: Send + Sync {
    /// The synthesis request is about to be issued.
    fn on_synthesis_start(&self) {}

    /// The first audio byte arrived; playback starts now.
    fn on_audio_start(&self) {}
}

/// Hooks that ignore every callback.
pub struct NoHooks;

impl SpeakHooks for NoHooks {}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakOptions {
    /// Stop whatever is playing first.  With `false` the call waits for the
    /// current utterance to finish instead.
    pub interrupt_previous: bool,
    pub synthesis: SynthesisOptions,
}

impl Default for SpeakOptions {
    fn default() -> Self {
        Self {
            interrupt_previous: true,
            synthesis: SynthesisOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every frame was played (or the provider returned no audio at all).
    Completed,
    /// [`SpeechPlayer::stop`] or a newer utterance cut it short.
    Stopped,
}

// ---------------------------------------------------------------------------
// Active slot
// ---------------------------------------------------------------------------

struct ActiveSlot {
    id: u64,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

struct Shared {
    next_id: AtomicU64,
    active: Mutex<Option<ActiveSlot>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSlot>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the slot when the owning `speak` call ends, however it ends.
struct ActiveGuard {
    shared: Arc<Shared>,
    id: u64,
    done: watch::Sender<bool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.shared.lock();
        if active.as_ref().is_some_and(|slot| slot.id == self.id) {
            *active = None;
        }
        drop(active);
        self.done.send_replace(true);
    }
}

async fn wait_until_true(mut rx: watch::Receiver<bool>) {
    stop_requested(&mut rx).await;
}

/// Resolves once the flag is set.  A dropped sender counts as set.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

// ---------------------------------------------------------------------------
// SpeechPlayer
// ---------------------------------------------------------------------------

pub struct SpeechPlayer {
    connection: Arc<dyn VoiceConnection>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    codec: Arc<dyn CodecFactory>,
    settings: PipelineSettings,
    shared: Arc<Shared>,
}

impl SpeechPlayer {
    pub fn new(
        connection: Arc<dyn VoiceConnection>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        codec: Arc<dyn CodecFactory>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            connection,
            synthesizer,
            codec,
            settings,
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                active: Mutex::new(None),
            }),
        }
    }

    /// `true` while an utterance holds the slot (synthesizing or playing).
    pub fn is_active(&self) -> bool {
        self.shared.lock().is_some()
    }

    /// Synthesize `text` and play it.  Resolves once playback has fully
    /// ended and the pipeline is gone.
    ///
    /// An error before the first audio byte means no pipeline was ever
    /// created; an error after it tears the pipeline down first.
    pub async fn speak(
        &self,
        text: &str,
        options: SpeakOptions,
        hooks: &dyn SpeakHooks,
    ) -> Result<PlaybackOutcome, SynthesisError> {
        let (guard, mut stop_rx) = self.claim(options.interrupt_previous).await;

        hooks.on_synthesis_start();
        log::info!(
            "synthesis: speaking {} chars via {}",
            text.chars().count(),
            self.synthesizer.name()
        );

        let stream = tokio::select! {
            _ = stop_requested(&mut stop_rx) => return Ok(PlaybackOutcome::Stopped),
            stream = self.synthesizer.synthesize(text, &options.synthesis) => stream?,
        };

        let (first, rest) = tokio::select! {
            _ = stop_requested(&mut stop_rx) => return Ok(PlaybackOutcome::Stopped),
            first = first_audio(stream) => match first? {
                Some(parts) => parts,
                None => {
                    log::warn!("synthesis: provider returned no audio");
                    return Ok(PlaybackOutcome::Completed);
                }
            },
        };

        hooks.on_audio_start();
        let mut pipeline = AudioPipeline::start(
            first,
            rest,
            self.connection.as_ref(),
            self.codec.encoder(),
            &self.settings,
        )?;

        let outcome = tokio::select! {
            _ = stop_requested(&mut stop_rx) => Ok(PlaybackOutcome::Stopped),
            played = pipeline.play() => played.map(|()| PlaybackOutcome::Completed),
        };
        pipeline.teardown().await;
        drop(guard);

        if let Err(e) = &outcome {
            log::warn!("synthesis: playback failed: {e}");
        }
        outcome
    }

    /// Stop the active utterance and wait until it has released everything.
    ///
    /// Returns `false` when nothing was playing.  Safe to call repeatedly and
    /// concurrently.
    pub async fn stop(&self, reason: &str) -> bool {
        let done = {
            let active = self.shared.lock();
            let Some(slot) = active.as_ref() else {
                return false;
            };
            if !slot.stop.send_replace(true) {
                log::info!("synthesis: stopping playback ({reason})");
            }
            slot.done.clone()
        };
        wait_until_true(done).await;
        true
    }

    async fn claim(&self, interrupt_previous: bool) -> (ActiveGuard, watch::Receiver<bool>) {
        loop {
            let busy = {
                let mut active = self.shared.lock();
                match active.as_ref() {
                    None => {
                        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                        let (stop, stop_rx) = watch::channel(false);
                        let (done_tx, done) = watch::channel(false);
                        *active = Some(ActiveSlot { id, stop, done });
                        let guard = ActiveGuard {
                            shared: Arc::clone(&self.shared),
                            id,
                            done: done_tx,
                        };
                        return (guard, stop_rx);
                    }
                    Some(slot) => {
                        if interrupt_previous && !slot.stop.send_replace(true) {
                            log::info!("synthesis: interrupting previous utterance");
                        }
                        slot.done.clone()
                    }
                }
            };
            wait_until_true(busy).await;
        }
    }
}

/// Wait for the first non-empty chunk.  `Ok(None)` when the stream ends
/// without audio.
async fn first_audio(
    mut stream: AudioByteStream,
) -> Result<Option<(Bytes, AudioByteStream)>, SynthesisError> {
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if !chunk.is_empty() {
            return Ok(Some((chunk, stream)));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
