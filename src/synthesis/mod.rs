//! Streaming speech synthesis and playback.
//!
//! ```text
//! SpeechSynthesizer::synthesize ──▶ AudioByteStream (mp3/opus bytes)
//!        │ first byte
//!        ▼
//! AudioPipeline: stream ─▶ Transcoder stdin ─▶ stdout PCM ─▶ FrameChunker
//!                 ─▶ FrameEncoder ─▶ PlayerSource ─▶ VoiceConnection player
//! ```
//!
//! [`SpeechPlayer`] owns the "one utterance at a time" rule and the stop
//! signal; [`AudioPipeline`] owns the subprocess and its tasks and tears both
//! down exactly once.

pub mod elevenlabs;
pub mod openai;
pub mod pipeline;
pub mod player;
pub mod transcoder;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

use crate::audio::codec::CodecError;
use crate::config::{SynthesisConfig, SynthesisProvider};

pub use elevenlabs::ElevenLabsSpeech;
pub use openai::OpenAiSpeech;
pub use pipeline::{AudioPipeline, PipelineSettings};
pub use player::{NoHooks, PlaybackOutcome, SpeakHooks, SpeakOptions, SpeechPlayer};
pub use transcoder::Transcoder;

// ---------------------------------------------------------------------------
// SynthesisError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no API key configured for {0}")]
    MissingApiKey(&'static str),

    /// HTTP transport, connection or status error.
    #[error("synthesis request failed: {0}")]
    Request(String),

    #[error("synthesis request timed out")]
    Timeout,

    /// The audio byte stream broke after it started.
    #[error("synthesis stream failed: {0}")]
    Stream(String),

    #[error("transcoder failed: {0}")]
    Transcoder(String),

    #[error("output player failed: {0}")]
    Player(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<reqwest::Error> for SynthesisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SynthesisError::Timeout
        } else {
            SynthesisError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// SpeechSynthesizer trait
// ---------------------------------------------------------------------------

/// Encoded audio as it arrives from the provider.
pub type AudioByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, SynthesisError>> + Send>>;

/// Per-utterance overrides of the configured voice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Start synthesizing `text`.  Resolves once the provider accepted the
    /// request; audio arrives on the returned stream.
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<AudioByteStream, SynthesisError>;
}

/// Build the back end for the configured provider.
pub fn synthesizer_from_config(
    config: &SynthesisConfig,
) -> Result<Arc<dyn SpeechSynthesizer>, SynthesisError> {
    Ok(match config.provider {
        SynthesisProvider::OpenAi => Arc::new(OpenAiSpeech::from_config(config)?),
        SynthesisProvider::ElevenLabs => Arc::new(ElevenLabsSpeech::from_config(config)?),
    })
}

/// Shared response check for the HTTP back ends.
async fn into_byte_stream(response: reqwest::Response) -> Result<AudioByteStream, SynthesisError> {
    use futures::StreamExt;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(SynthesisError::Request(format!("HTTP {status}: {detail}")));
    }
    Ok(response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| SynthesisError::Stream(e.to_string())))
        .boxed())
}
