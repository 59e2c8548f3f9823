//! OpenAI `/v1/audio/speech` back end.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{resolve_api_key, SynthesisConfig};
use crate::synthesis::{
    into_byte_stream, AudioByteStream, SpeechSynthesizer, SynthesisError, SynthesisOptions,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "alloy";

pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    response_format: String,
    speed: f32,
}

impl OpenAiSpeech {
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, SynthesisError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), "OPENAI_API_KEY")
            .ok_or(SynthesisError::MissingApiKey("openai"))?;
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
            response_format: config.response_format.clone(),
            speed: config.speed,
        })
    }

    fn request_body(&self, text: &str, options: &SynthesisOptions) -> serde_json::Value {
        serde_json::json!({
            "model":           self.model,
            "input":           text,
            "voice":           options.voice.as_deref().unwrap_or(&self.voice),
            "response_format": self.response_format,
            "speed":           options.speed.unwrap_or(self.speed)
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
    ) -> Result<AudioByteStream, SynthesisError> {
        let url = format!("{}/v1/audio/speech", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, options))
            .send()
            .await?;
        into_byte_stream(response).await
    }
}
