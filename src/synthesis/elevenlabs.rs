//! ElevenLabs streaming text-to-speech back end.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{resolve_api_key, SynthesisConfig};
use crate::synthesis::{
    into_byte_stream, AudioByteStream, SpeechSynthesizer, SynthesisError, SynthesisOptions,
};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_MODEL: &str = "eleven_turbo_v2_5";
const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
const OUTPUT_FORMAT: &str = "mp3_44100_128";

pub struct ElevenLabsSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    speed: f32,
}

impl ElevenLabsSpeech {
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, SynthesisError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "ELEVENLABS_API_KEY")
            .ok_or(SynthesisError::MissingApiKey("elevenlabs"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            api_key,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            voice: config.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.into()),
            speed: config.speed,
        })
    }

    fn url(&self, options: &SynthesisOptions) -> String {
        let voice = options.voice.as_deref().unwrap_or(&self.voice);
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format={}",
            self.base_url, voice, OUTPUT_FORMAT
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSpeech {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<AudioByteStream, SynthesisError> {
        let body = serde_json::json!({
            "text":     text,
            "model_id": self.model,
            "voice_settings": {
                "speed": options.speed.unwrap_or(self.speed)
            }
        });

        let response = self
            .client
            .post(self.url(options))
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        into_byte_stream(response).await
    }
}
