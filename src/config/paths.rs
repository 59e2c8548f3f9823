//! Location of `settings.toml`.
//!
//! `$VOICE_BRIDGE_CONFIG` names the file directly.  Otherwise it lives in the
//! platform config directory from `dirs`, e.g. `~/.config/voice-bridge/` on
//! Linux.

use std::ffi::OsString;
use std::path::PathBuf;

/// Environment variable overriding the settings file path.
pub const CONFIG_ENV: &str = "VOICE_BRIDGE_CONFIG";

const APP_DIR: &str = "voice-bridge";
const SETTINGS_FILE: &str = "settings.toml";

/// Per-user config directory, or `./voice-bridge` where the platform has none.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn settings_path() -> PathBuf {
    resolve_settings_path(std::env::var_os(CONFIG_ENV))
}

fn resolve_settings_path(overridden: Option<OsString>) -> PathBuf {
    match overridden.filter(|p| !p.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => config_dir().join(SETTINGS_FILE),
    }
}
