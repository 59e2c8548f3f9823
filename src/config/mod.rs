//! Configuration for the voice bridge.
//!
//! Provides `BridgeConfig` (top-level settings), one section per subsystem,
//! the settings file location (overridable via `$VOICE_BRIDGE_CONFIG`), and TOML persistence via
//! `BridgeConfig::load` / `BridgeConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::{config_dir, settings_path, CONFIG_ENV};
pub use settings::{
    resolve_api_key, AudioConfig, BridgeConfig, InferenceConfig, SessionConfig, SpeakingConfig,
    SynthesisConfig, SynthesisProvider, TranscoderConfig, TranscriptionConfig,
    TranscriptionProvider, TriggerMode, TurnConfig,
};
