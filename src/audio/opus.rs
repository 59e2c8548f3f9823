//! Opus codec for transports that carry compressed voice packets.
//!
//! Each speaker stream gets its own libopus decoder, and each outbound
//! pipeline its own encoder.  Packets decode to interleaved PCM in the
//! configured [`PcmFormat`]; outbound frames must be one of the durations
//! Opus accepts (2.5, 5, 10, 20, 40 or 60 ms).

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};

use crate::audio::codec::{CodecError, CodecFactory, FrameDecoder, FrameEncoder, PcmFormat};

/// Largest Opus frame: 120 ms at 48 kHz, per channel.
const MAX_FRAME_SAMPLES: usize = 5_760;
/// Upper bound recommended by libopus for one encoded packet.
const MAX_PACKET_BYTES: usize = 4_000;

fn sample_rate(format: PcmFormat) -> Result<SampleRate, CodecError> {
    match format.sample_rate {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(CodecError::Decode(format!("opus does not support {other} Hz"))),
    }
}

fn channels(format: PcmFormat) -> Result<Channels, CodecError> {
    match format.channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(CodecError::Decode(format!("opus does not support {other} channels"))),
    }
}

// ---------------------------------------------------------------------------
// OpusCodec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct OpusCodec {
    format: PcmFormat,
}

impl OpusCodec {
    /// Fails when libopus cannot handle `format`.
    pub fn new(format: PcmFormat) -> Result<Self, CodecError> {
        let codec = Self { format };
        // Surface libopus init errors here rather than on the first packet.
        codec.new_decoder()?;
        codec.new_encoder()?;
        Ok(codec)
    }

    fn new_decoder(&self) -> Result<Decoder, CodecError> {
        Decoder::new(sample_rate(self.format)?, channels(self.format)?)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn new_encoder(&self) -> Result<Encoder, CodecError> {
        Encoder::new(sample_rate(self.format)?, channels(self.format)?, Application::Voip)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

struct OpusFrameDecoder {
    decoder: Result<Decoder, CodecError>,
    channels: usize,
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let decoder = self.decoder.as_mut().map_err(|e| e.clone())?;
        let mut pcm = vec![0_i16; MAX_FRAME_SAMPLES * self.channels];
        let per_channel = decoder
            .decode(Some(packet), &mut pcm[..], false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        pcm.truncate(per_channel * self.channels);
        Ok(pcm)
    }
}

struct OpusFrameEncoder {
    encoder: Result<Encoder, CodecError>,
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let encoder = self.encoder.as_mut().map_err(|e| e.clone())?;
        let mut packet = vec![0_u8; MAX_PACKET_BYTES];
        let len = encoder
            .encode(pcm, &mut packet[..])
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        packet.truncate(len);
        Ok(packet)
    }
}

impl CodecFactory for OpusCodec {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(OpusFrameDecoder {
            decoder: self.new_decoder(),
            channels: self.format.channels as usize,
        })
    }

    fn encoder(&self) -> Box<dyn FrameEncoder> {
        Box::new(OpusFrameEncoder {
            encoder: self.new_encoder(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
