//! Audio path — transport packets → PCM → per-speaker buffers → mixed frames.
//!
//! # Pipeline
//!
//! ```text
//! transport packet → FrameDecoder → LinkFormatAdapter (downmix + resample)
//!                  → AudioMixer::ingest → SpeakerBuffer → AudioMixer::tick → link
//!
//! transcoder PCM   → FrameChunker → FrameEncoder → transport player
//! ```

pub mod buffer;
pub mod codec;
pub mod mixer;
#[cfg(feature = "opus")]
pub mod opus;
pub mod resample;

pub use buffer::SpeakerBuffer;
pub use codec::{
    pcm_bytes_to_samples, samples_to_pcm_bytes, CodecError, CodecFactory, FrameChunker,
    FrameDecoder, FrameEncoder, LinkFormatAdapter, PcmFormat, RawPcmCodec, DEFAULT_FRAME_MS,
};
pub use mixer::{AudioMixer, MixFrame};
#[cfg(feature = "opus")]
pub use opus::OpusCodec;
pub use resample::{downmix_to_mono, resample_linear};
