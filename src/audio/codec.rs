//! Frame codec adapter between the voice transport and linear PCM.
//!
//! Inbound, every speaker stream gets its own [`FrameDecoder`] (codecs such as
//! Opus keep per-stream state) and the decoded transport-format PCM is
//! converted to the transcription link's format by [`LinkFormatAdapter`].
//! Outbound, the transcoder's raw PCM is cut into fixed transport frames by
//! [`FrameChunker`] and handed to a [`FrameEncoder`].
//!
//! The transport collaborator decides which codec it speaks by providing a
//! [`CodecFactory`].  [`RawPcmCodec`] covers transports that already carry
//! signed 16-bit little-endian PCM; with the `opus` feature,
//! `audio::OpusCodec` decodes and encodes Opus voice packets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::resample::{downmix_to_mono, resample_linear};

/// Default frame duration shared by the mixer, the silence injector and the
/// outbound player.
pub const DEFAULT_FRAME_MS: u32 = 20;

// ---------------------------------------------------------------------------
// PcmFormat
// ---------------------------------------------------------------------------

/// Sample rate and channel layout of a signed 16-bit PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// What the voice transport sends and expects: 48 kHz stereo.
    pub const TRANSPORT: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
    };

    /// What the realtime transcription link expects: 24 kHz mono.
    pub const LINK: PcmFormat = PcmFormat {
        sample_rate: 24_000,
        channels: 1,
    };

    /// Interleaved samples in one frame of `frame_ms` milliseconds.
    ///
    /// ```rust
    /// use voice_bridge::audio::PcmFormat;
    ///
    /// assert_eq!(PcmFormat::TRANSPORT.samples_per_frame(20), 1_920);
    /// assert_eq!(PcmFormat::LINK.samples_per_frame(20), 480);
    /// ```
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        (self.sample_rate as usize * frame_ms as usize / 1_000) * self.channels as usize
    }

    /// Bytes in one frame of `frame_ms` milliseconds (2 bytes per sample).
    pub fn bytes_per_frame(&self, frame_ms: u32) -> usize {
        self.samples_per_frame(frame_ms) * 2
    }
}

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Errors raised while converting between transport packets and PCM.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A raw PCM payload must hold whole 16-bit samples.
    #[error("PCM payload has odd length {0}")]
    OddLength(usize),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

// ---------------------------------------------------------------------------
// Codec traits
// ---------------------------------------------------------------------------

/// Turns one inbound transport packet into interleaved PCM samples.
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Turns one frame of interleaved PCM into an outbound transport packet.
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Builds decoders and encoders for the codec a transport speaks.
pub trait CodecFactory: Send + Sync {
    /// PCM layout produced by decoders and consumed by encoders.
    fn format(&self) -> PcmFormat;

    fn decoder(&self) -> Box<dyn FrameDecoder>;

    fn encoder(&self) -> Box<dyn FrameEncoder>;
}

// ---------------------------------------------------------------------------
// RawPcmCodec
// ---------------------------------------------------------------------------

/// Codec for transports that carry signed 16-bit little-endian PCM as-is.
#[derive(Debug, Clone, Copy)]
pub struct RawPcmCodec {
    format: PcmFormat,
}

impl RawPcmCodec {
    pub fn new(format: PcmFormat) -> Self {
        Self { format }
    }
}

impl Default for RawPcmCodec {
    fn default() -> Self {
        Self::new(PcmFormat::TRANSPORT)
    }
}

struct RawPcmDecoder;

impl FrameDecoder for RawPcmDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        pcm_bytes_to_samples(packet)
    }
}

struct RawPcmEncoder;

impl FrameEncoder for RawPcmEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        Ok(samples_to_pcm_bytes(pcm))
    }
}

impl CodecFactory for RawPcmCodec {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(RawPcmDecoder)
    }

    fn encoder(&self) -> Box<dyn FrameEncoder> {
        Box::new(RawPcmEncoder)
    }
}

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

/// Interpret `bytes` as signed 16-bit little-endian samples.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serialize samples as signed 16-bit little-endian bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// LinkFormatAdapter
// ---------------------------------------------------------------------------

/// Converts decoded transport PCM into the transcription link's mono format.
#[derive(Debug, Clone, Copy)]
pub struct LinkFormatAdapter {
    source: PcmFormat,
    target: PcmFormat,
}

impl LinkFormatAdapter {
    /// `target` is treated as mono regardless of its channel count.
    pub fn new(source: PcmFormat, target: PcmFormat) -> Self {
        Self { source, target }
    }

    pub fn convert(&self, pcm: &[i16]) -> Vec<i16> {
        let mono = downmix_to_mono(pcm, self.source.channels);
        resample_linear(&mono, self.source.sample_rate, self.target.sample_rate)
    }
}

// ---------------------------------------------------------------------------
// FrameChunker
// ---------------------------------------------------------------------------

/// Re-frames an arbitrary byte stream into fixed-size transport frames.
#[derive(Debug)]
pub struct FrameChunker {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameChunker {
    /// # Panics
    ///
    /// Panics if `frame_bytes == 0`.
    pub fn new(frame_bytes: usize) -> Self {
        assert!(frame_bytes > 0, "frame size must be > 0");
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes * 2),
        }
    }

    /// Buffer `bytes` and return every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);
        let complete = self.pending.len() / self.frame_bytes;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            let rest = self.pending.split_off(self.frame_bytes);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Zero-pad and return the leftover partial frame, if any.
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.resize(self.frame_bytes, 0);
        Some(self.pending)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
