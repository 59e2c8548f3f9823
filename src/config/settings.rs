//! Bridge settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::paths::settings_path;
use crate::audio::codec::{PcmFormat, DEFAULT_FRAME_MS};

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Frame cadence and PCM layouts on both sides of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Duration of one mixed / played frame in milliseconds.
    pub frame_ms: u32,
    /// Frames buffered per speaker before the oldest samples are dropped.
    pub max_buffered_frames: usize,
    /// Encoded frames queued between the transcoder and the output player.
    pub player_buffer_frames: usize,
    /// Layout the voice transport sends and plays (48 kHz stereo).
    pub transport_format: PcmFormat,
    /// Layout the transcription link expects (24 kHz mono).
    pub link_format: PcmFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_ms: DEFAULT_FRAME_MS,
            max_buffered_frames: 10,
            player_buffer_frames: 50,
            transport_format: PcmFormat::TRANSPORT,
            link_format: PcmFormat::LINK,
        }
    }
}

impl AudioConfig {
    /// `frame_ms`, never below one millisecond.
    pub fn cadence_ms(&self) -> u32 {
        self.frame_ms.max(1)
    }
}

// ---------------------------------------------------------------------------
// SpeakingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    /// Delay between a speaking-end event and releasing the speaker.
    pub debounce_ms: u64,
    /// How long silent frames keep flowing after the last speaker leaves.
    pub silence_injection_ms: u64,
    /// Commit the link's audio buffer once silence injection finishes.
    pub commit_after_silence: bool,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            silence_injection_ms: 1_000,
            commit_after_silence: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerMode / TurnConfig
// ---------------------------------------------------------------------------

/// Which finalized transcripts start a conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerMode {
    /// Every transcript triggers.
    Always,
    /// Only transcripts containing one of `phrases` (case-insensitive).
    WakePhrase { phrases: Vec<String> },
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::Always
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Minimum playback time before a new transcript may interrupt a reply.
    pub interrupt_window_ms: u64,
    /// Transcript entries kept in the session history.
    pub history_cap: usize,
    /// Never cut a reply short, neither by transcript nor by VAD.
    pub prevent_interruptions: bool,
    /// Spoken when inference fails.  Empty disables the apology.
    pub apology_message: String,
    /// End the session after the apology has been spoken.
    pub disconnect_on_inference_failure: bool,
    pub trigger: TriggerMode,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            interrupt_window_ms: 2_000,
            history_cap: 50,
            prevent_interruptions: false,
            apology_message: "Sorry, something went wrong on my end. I have to go.".into(),
            disconnect_on_inference_failure: true,
            trigger: TriggerMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard session length.  `None` means unlimited.
    pub time_limit_secs: Option<u64>,
    /// How long to wait for the current turn to finish once the limit passes.
    pub time_limit_grace_secs: u64,
    /// Spoken once when the connection becomes ready.
    pub announcement: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: None,
            time_limit_grace_secs: 10,
            announcement: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TranscriptionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionProvider {
    /// OpenAI realtime transcription websocket.
    OpenAiRealtime,
}

impl Default for TranscriptionProvider {
    fn default() -> Self {
        Self::OpenAiRealtime
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub provider: TranscriptionProvider,
    /// Websocket endpoint.
    pub url: String,
    /// `None` or empty falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    /// ISO-639-1 hint; `None` lets the service detect the language.
    pub language: Option<String>,
    /// Server VAD activation threshold (0.0 – 1.0).
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: TranscriptionProvider::default(),
            url: "wss://api.openai.com/v1/realtime?intent=transcription".into(),
            api_key: None,
            model: "gpt-4o-transcribe".into(),
            language: None,
            vad_threshold: 0.5,
            vad_prefix_padding_ms: 300,
            vad_silence_duration_ms: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// InferenceConfig
// ---------------------------------------------------------------------------

/// Settings for the conversational language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of an OpenAI-compatible API.
    ///
    /// - OpenAI: `https://api.openai.com`
    /// - Ollama: `http://localhost:11434`
    pub base_url: String,
    /// `None` or empty falls back to `OPENAI_API_KEY`; local providers need none.
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub system_prompt: String,
    /// Transcript lines and replies kept in the rolling conversation window.
    pub window_size: usize,
    /// Silence after which the conversation window is cleared.
    pub reset_silence_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 300,
            timeout_secs: 20,
            system_prompt: "You are a friendly participant in a voice chat. Keep replies short \
                            and conversational; they are read aloud."
                .into(),
            window_size: 20,
            reset_silence_secs: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// SynthesisConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisProvider {
    OpenAi,
    ElevenLabs,
}

impl Default for SynthesisProvider {
    fn default() -> Self {
        Self::OpenAi
    }
}

/// External process that converts synthesized audio into transport PCM.
///
/// The program reads the encoded stream on stdin and writes raw s16le PCM in
/// the transport format on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        let args = [
            "-loglevel", "error", "-i", "pipe:0", "-f", "s16le", "-ar", "48000", "-ac", "2",
            "pipe:1",
        ];
        Self {
            program: "ffmpeg".into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub provider: SynthesisProvider,
    /// `None` uses the provider's public endpoint.
    pub base_url: Option<String>,
    /// `None` or empty falls back to `OPENAI_API_KEY` / `ELEVENLABS_API_KEY`.
    pub api_key: Option<String>,
    /// `None` uses the provider's default model.
    pub model: Option<String>,
    /// Voice name (OpenAI) or voice id (ElevenLabs); `None` uses the
    /// provider's default voice.
    pub voice: Option<String>,
    /// Encoded format requested from the provider.
    pub response_format: String,
    pub speed: f32,
    pub timeout_secs: u64,
    pub transcoder: TranscoderConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisProvider::default(),
            base_url: None,
            api_key: None,
            model: None,
            voice: None,
            response_format: "mp3".into(),
            speed: 1.0,
            timeout_secs: 60,
            transcoder: TranscoderConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level bridge configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use voice_bridge::config::BridgeConfig;
///
/// // Load (returns Default when file is missing)
/// let config = BridgeConfig::load().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub audio: AudioConfig,
    pub speaking: SpeakingConfig,
    pub turn: TurnConfig,
    pub session: SessionConfig,
    pub transcription: TranscriptionConfig,
    pub inference: InferenceConfig,
    pub synthesis: SynthesisConfig,
}

impl BridgeConfig {
    /// Load from [`settings_path`].  A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&settings_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Write to [`settings_path`], creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&settings_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Pick the configured key, falling back to the environment variable.
///
/// Empty strings count as absent in both places.
pub fn resolve_api_key(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = BridgeConfig::default();
        original.save_to(&path).expect("save");

        let loaded = BridgeConfig::load_from(&path).expect("load");
        assert_eq!(original, loaded);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = BridgeConfig::load_from(&path).expect("should not error");
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn default_values() {
        let cfg = BridgeConfig::default();

        assert_eq!(cfg.audio.frame_ms, 20);
        assert_eq!(cfg.audio.max_buffered_frames, 10);
        assert_eq!(cfg.audio.transport_format, PcmFormat::TRANSPORT);
        assert_eq!(cfg.audio.link_format, PcmFormat::LINK);
        assert_eq!(cfg.speaking.debounce_ms, 250);
        assert_eq!(cfg.speaking.silence_injection_ms, 1_000);
        assert_eq!(cfg.turn.interrupt_window_ms, 2_000);
        assert_eq!(cfg.turn.history_cap, 50);
        assert_eq!(cfg.turn.trigger, TriggerMode::Always);
        assert!(!cfg.turn.prevent_interruptions);
        assert_eq!(cfg.session.time_limit_grace_secs, 10);
        assert!(cfg.session.time_limit_secs.is_none());
        assert_eq!(cfg.synthesis.provider, SynthesisProvider::OpenAi);
        assert_eq!(cfg.synthesis.transcoder.program, "ffmpeg");
        assert!(cfg.inference.api_key.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            r#"
[turn]
interrupt_window_ms = 500

[turn.trigger]
mode = "wake_phrase"
phrases = ["hey bot"]

[synthesis]
provider = "eleven_labs"
voice = "21m00Tcm4TlvDq8ikWAM"
"#,
        )
        .expect("write");

        let cfg = BridgeConfig::load_from(&path).expect("load");
        assert_eq!(cfg.turn.interrupt_window_ms, 500);
        assert_eq!(cfg.turn.history_cap, 50);
        assert_eq!(
            cfg.turn.trigger,
            TriggerMode::WakePhrase {
                phrases: vec!["hey bot".into()]
            }
        );
        assert_eq!(cfg.synthesis.provider, SynthesisProvider::ElevenLabs);
        assert_eq!(cfg.synthesis.model, None);
        assert_eq!(cfg.synthesis.voice.as_deref(), Some("21m00Tcm4TlvDq8ikWAM"));
        assert_eq!(cfg.speaking, SpeakingConfig::default());
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested/modified.toml");

        let mut cfg = BridgeConfig::default();
        cfg.session.time_limit_secs = Some(300);
        cfg.session.announcement = Some("Hello everyone".into());
        cfg.inference.api_key = Some("sk-test".into());
        cfg.transcription.language = Some("en".into());
        cfg.turn.trigger = TriggerMode::WakePhrase {
            phrases: vec!["computer".into(), "hey bridge".into()],
        };

        cfg.save_to(&path).expect("save");
        let loaded = BridgeConfig::load_from(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn resolve_api_key_prefers_configured_value() {
        assert_eq!(
            resolve_api_key(Some("sk-file"), "VOICE_BRIDGE_TEST_UNSET_KEY"),
            Some("sk-file".into())
        );
        assert_eq!(resolve_api_key(Some(""), "VOICE_BRIDGE_TEST_UNSET_KEY"), None);
        assert_eq!(resolve_api_key(None, "VOICE_BRIDGE_TEST_UNSET_KEY"), None);
    }
}
