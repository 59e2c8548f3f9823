//! Multi-speaker mixer feeding the transcription link.
//!
//! Every speaker's decoded PCM (already in link format) lands in its own
//! [`SpeakerBuffer`].  On each tick of the session's mix timer the mixer takes
//! one frame from every speaker that has a full frame buffered, sums them
//! sample-wise with saturation, divides by the number of contributors and
//! hands the result to the link.
//!
//! ```text
//! speaker A ──ingest──▶ SpeakerBuffer ─┐
//! speaker B ──ingest──▶ SpeakerBuffer ─┼─tick──▶ MixFrame ──▶ TranscriptionLink
//! speaker C ──ingest──▶ SpeakerBuffer ─┘
//! ```

use std::collections::HashMap;

use crate::audio::buffer::SpeakerBuffer;
use crate::audio::codec::samples_to_pcm_bytes;
use crate::config::AudioConfig;
use crate::transcription::TranscriptionLink;
use crate::transport::SpeakerId;

// ---------------------------------------------------------------------------
// MixFrame
// ---------------------------------------------------------------------------

/// One fixed-duration block of mixed mono PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct MixFrame {
    pub samples: Vec<i16>,
    /// Number of speakers that contributed to this frame.
    pub contributors: usize,
}

impl MixFrame {
    /// `true` when every sample is zero.
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|&s| s == 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        samples_to_pcm_bytes(&self.samples)
    }
}

// ---------------------------------------------------------------------------
// AudioMixer
// ---------------------------------------------------------------------------

/// Accumulates per-speaker PCM and produces fixed-cadence mixed frames.
pub struct AudioMixer {
    frame_samples: usize,
    max_buffered_frames: usize,
    buffers: HashMap<SpeakerId, SpeakerBuffer>,
}

impl AudioMixer {
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(frame_samples: usize, max_buffered_frames: usize) -> Self {
        assert!(frame_samples > 0, "frame_samples must be > 0");
        assert!(max_buffered_frames > 0, "max_buffered_frames must be > 0");
        Self {
            frame_samples,
            max_buffered_frames,
            buffers: HashMap::new(),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.link_format.samples_per_frame(config.cadence_ms()).max(1),
            config.max_buffered_frames.max(1),
        )
    }

    /// Append `pcm` to the speaker's buffer, creating it on first use.
    ///
    /// Once `max_buffered_frames` frames are waiting the oldest samples are
    /// evicted.
    pub fn ingest(&mut self, speaker: &SpeakerId, pcm: &[i16]) {
        let (frame_samples, max_frames) = (self.frame_samples, self.max_buffered_frames);
        let evicted = self
            .buffers
            .entry(speaker.clone())
            .or_insert_with(|| SpeakerBuffer::new(frame_samples, max_frames))
            .push(pcm);
        if evicted > 0 {
            log::debug!("mixer: dropped {evicted} stale samples for {speaker}");
        }
    }

    /// Evict the speaker's buffer immediately.  Returns `true` if one existed.
    pub fn remove(&mut self, speaker: &SpeakerId) -> bool {
        self.buffers.remove(speaker).is_some()
    }

    /// Mix one frame from every speaker holding at least a full frame.
    ///
    /// Returns `None` when nobody contributed.
    pub fn tick(&mut self) -> Option<MixFrame> {
        let mut acc = vec![0_i32; self.frame_samples];
        let mut contributors = 0_usize;

        for buffer in self.buffers.values_mut() {
            let Some(frame) = buffer.pop_frame() else {
                continue;
            };
            for (slot, sample) in acc.iter_mut().zip(frame) {
                *slot += sample as i32;
            }
            contributors += 1;
        }

        if contributors == 0 {
            return None;
        }

        let samples = acc
            .into_iter()
            .map(|sum| {
                let saturated = sum.clamp(i16::MIN as i32, i16::MAX as i32);
                (saturated / contributors as i32) as i16
            })
            .collect();

        Some(MixFrame {
            samples,
            contributors,
        })
    }

    /// Tick and forward the frame to `sink`.
    ///
    /// Frames are dropped, not queued, while the sink is disconnected, and an
    /// all-zero frame is never sent.  Returns `true` when a frame went out.
    pub fn flush_to(&mut self, sink: &dyn TranscriptionLink) -> bool {
        let Some(frame) = self.tick() else {
            return false;
        };
        if frame.is_silent() || !sink.is_connected() {
            return false;
        }
        match sink.send_audio(frame.to_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("mixer: frame dropped: {e}");
                false
            }
        }
    }

    /// Number of speakers with a live buffer.
    pub fn speaker_count(&self) -> usize {
        self.buffers.len()
    }

    /// Samples currently waiting for `speaker`.
    pub fn buffered(&self, speaker: &SpeakerId) -> usize {
        self.buffers.get(speaker).map_or(0, |b| b.len())
    }

    /// Samples in one mixed frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
