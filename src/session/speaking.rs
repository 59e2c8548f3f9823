//! Per-speaker capture lifecycle and silence injection.
//!
//! A speaker goes live on its first speaking-start: one packet subscription
//! and one decode task, no matter how many starts follow.  A speaking-end
//! only arms a debounce timer; the speaker is torn down when that timer
//! fires without an intervening start.  When the last speaker leaves, a
//! capped stretch of silent frames keeps the transcription link's voice
//! detector moving towards end-of-speech.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::codec::{samples_to_pcm_bytes, CodecFactory, FrameDecoder, LinkFormatAdapter};
use crate::audio::mixer::AudioMixer;
use crate::config::{AudioConfig, SpeakingConfig};
use crate::session::events::SessionEvent;
use crate::session::lifecycle::{ShutdownFlag, TimerSlot};
use crate::transcription::TranscriptionLink;
use crate::transport::{PacketStream, SpeakerId, VoiceConnection};

struct Speaker {
    joined_at: Instant,
    generation: u64,
    capture: JoinHandle<()>,
    debounce: TimerSlot,
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.capture.abort();
    }
}

pub(crate) struct SpeakingLifecycle {
    speakers: HashMap<SpeakerId, Speaker>,
    mixer: AudioMixer,
    codec: Arc<dyn CodecFactory>,
    adapter: LinkFormatAdapter,
    events: mpsc::Sender<SessionEvent>,
    flag: ShutdownFlag,
    debounce: Duration,
    silence_window: Duration,
    commit_after_silence: bool,
    silence_until: Option<Instant>,
    silent_frame: Vec<u8>,
    next_generation: u64,
}

impl SpeakingLifecycle {
    pub(crate) fn new(
        audio: &AudioConfig,
        speaking: &SpeakingConfig,
        codec: Arc<dyn CodecFactory>,
        events: mpsc::Sender<SessionEvent>,
        flag: ShutdownFlag,
    ) -> Self {
        let mixer = AudioMixer::from_config(audio);
        let silent_frame = samples_to_pcm_bytes(&vec![0; mixer.frame_samples()]);
        Self {
            speakers: HashMap::new(),
            adapter: LinkFormatAdapter::new(codec.format(), audio.link_format),
            mixer,
            codec,
            events,
            flag,
            debounce: Duration::from_millis(speaking.debounce_ms),
            silence_window: Duration::from_millis(speaking.silence_injection_ms),
            commit_after_silence: speaking.commit_after_silence,
            silence_until: None,
            silent_frame,
            next_generation: 0,
        }
    }

    /// A participant started speaking.  Returns `true` when a new capture
    /// stream was opened.
    pub(crate) fn on_speaking_start(&mut self, id: &SpeakerId, connection: &dyn VoiceConnection) -> bool {
        if self.flag.is_set() {
            return false;
        }
        if let Some(speaker) = self.speakers.get_mut(id) {
            if speaker.debounce.is_armed() {
                log::debug!("session: {id} resumed speaking, debounce cancelled");
            }
            speaker.debounce.cancel();
            return false;
        }

        let packets = match connection.subscribe_to_speaker(id) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("session: {e}");
                return false;
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let capture = tokio::spawn(capture(
            id.clone(),
            generation,
            packets,
            self.codec.decoder(),
            self.adapter,
            self.events.clone(),
        ));
        self.speakers.insert(
            id.clone(),
            Speaker {
                joined_at: Instant::now(),
                generation,
                capture,
                debounce: TimerSlot::new(),
            },
        );
        self.silence_until = None;
        log::info!("session: capturing {id} ({} live)", self.speakers.len());
        true
    }

    /// A participant stopped speaking: arm (or re-arm) its debounce timer.
    pub(crate) fn on_speaking_end(&mut self, id: &SpeakerId) {
        if self.flag.is_set() {
            return;
        }
        let Some(speaker) = self.speakers.get_mut(id) else {
            return;
        };
        let speaker_id = id.clone();
        speaker
            .debounce
            .schedule(self.debounce, &self.events, move |generation| {
                SessionEvent::DebounceElapsed {
                    speaker: speaker_id,
                    generation,
                }
            });
    }

    pub(crate) fn on_debounce_elapsed(&mut self, id: &SpeakerId, generation: u64) {
        let current = self
            .speakers
            .get_mut(id)
            .is_some_and(|speaker| speaker.debounce.fire(generation));
        if current {
            self.teardown(id, "stopped speaking");
        }
    }

    pub(crate) fn on_captured(&mut self, id: &SpeakerId, generation: u64, pcm: &[i16]) {
        if self.speakers.get(id).is_some_and(|s| s.generation == generation) {
            self.mixer.ingest(id, pcm);
        }
    }

    /// A capture stream ended.  Faults stay local to the speaker.
    pub(crate) fn on_capture_ended(&mut self, id: &SpeakerId, generation: u64, error: Option<&str>) {
        if !self.speakers.get(id).is_some_and(|s| s.generation == generation) {
            return;
        }
        match error {
            Some(e) => {
                log::warn!("session: capture for {id} failed: {e}");
                self.teardown(id, "capture failed");
            }
            None => self.teardown(id, "stream ended"),
        }
    }

    /// Emit at most one frame to the link: mixed audio if any is ready,
    /// otherwise a silent frame while the silence window is open.
    pub(crate) fn tick(&mut self, link: &dyn TranscriptionLink, now: Instant) {
        if self.mixer.flush_to(link) {
            return;
        }
        let Some(until) = self.silence_until else {
            return;
        };
        if now >= until {
            self.silence_until = None;
            if self.commit_after_silence {
                if let Err(e) = link.commit() {
                    log::debug!("session: commit after silence failed: {e}");
                }
            }
            return;
        }
        if self.speakers.is_empty() && link.is_connected() {
            if let Err(e) = link.send_audio(self.silent_frame.clone()) {
                log::debug!("session: silent frame dropped: {e}");
            }
        }
    }

    /// Drop every speaker and stop silence injection.
    pub(crate) fn detach_all(&mut self) {
        for (id, _) in self.speakers.drain() {
            self.mixer.remove(&id);
        }
        self.silence_until = None;
    }

    /// The live speaker who started speaking first.
    pub(crate) fn primary_speaker(&self) -> Option<&SpeakerId> {
        self.speakers
            .iter()
            .min_by_key(|(_, speaker)| speaker.joined_at)
            .map(|(id, _)| id)
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: &SpeakerId) -> bool {
        self.speakers.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn speaker_count(&self) -> usize {
        self.speakers.len()
    }

    #[cfg(test)]
    pub(crate) fn silence_active(&self) -> bool {
        self.silence_until.is_some()
    }

    fn teardown(&mut self, id: &SpeakerId, reason: &str) {
        if self.speakers.remove(id).is_none() {
            return;
        }
        self.mixer.remove(id);
        log::info!("session: released {id} ({reason})");
        if self.speakers.is_empty() && !self.silence_window.is_zero() && !self.flag.is_set() {
            self.silence_until = Some(Instant::now() + self.silence_window);
        }
    }
}

async fn capture(
    speaker: SpeakerId,
    generation: u64,
    mut packets: PacketStream,
    mut decoder: Box<dyn FrameDecoder>,
    adapter: LinkFormatAdapter,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut error = None;
    while let Some(packet) = packets.recv().await {
        let decoded = packet
            .map_err(|e| e.to_string())
            .and_then(|packet| decoder.decode(&packet).map_err(|e| e.to_string()));
        match decoded {
            Ok(pcm) => {
                let event = SessionEvent::Captured {
                    speaker: speaker.clone(),
                    generation,
                    pcm: adapter.convert(&pcm),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    let _ = events
        .send(SessionEvent::CaptureEnded {
            speaker,
            generation,
            error,
        })
        .await;
}
