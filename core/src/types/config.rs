//! Daemon and sync settings.
//!
//! All timing knobs have compiled-in defaults; a YAML settings file in the
//! config directory overrides them per-field. The 100ms poll / 300ms recheck
//! pair is a deliberate responsiveness-vs-overhead tradeoff and is fixed at
//! the controller level — the settings here size the host process, not the
//! convergence cadence.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Poll interval while a controller has not yet heard from the store (ms).
pub const POLL_INTERVAL_MS: u64 = 100;
/// Recheck interval once a controller has converged (ms).
pub const RECHECK_INTERVAL_MS: u64 = 300;
/// Delay before a relay attempts to re-establish a lost connection (ms).
pub const RECONNECT_DELAY_MS: u64 = 1000;
/// Period of the store's per-connection liveness broadcast (ms).
pub const LIVENESS_INTERVAL_MS: u64 = 1000;

/// An additional flag registered from the settings file, beyond the
/// compiled-in table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraFlag {
    pub key: String,
    #[serde(default)]
    pub default_value: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version: String,
    /// How long the daemon waits for socket connections per loop tick (ms).
    #[serde(default = "default_socket_poll_ms")]
    pub socket_poll_ms: u64,
    /// Read timeout for one-shot command clients (ms).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Delay before a relay redials a lost port connection (ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Period of the per-connection liveness broadcast (ms).
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Flags to initialize in addition to the compiled-in table.
    #[serde(default)]
    pub extra_flags: Vec<ExtraFlag>,
}

fn default_socket_poll_ms() -> u64 {
    50
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_delay_ms() -> u64 {
    RECONNECT_DELAY_MS
}

fn default_liveness_interval_ms() -> u64 {
    LIVENESS_INTERVAL_MS
}

/// Returns sensible defaults for all settings fields.
pub fn default_settings() -> Settings {
    Settings {
        version: "0.1.0".into(),
        socket_poll_ms: default_socket_poll_ms(),
        command_timeout_ms: default_command_timeout_ms(),
        reconnect_delay_ms: default_reconnect_delay_ms(),
        liveness_interval_ms: default_liveness_interval_ms(),
        extra_flags: Vec::new(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        default_settings()
    }
}

/// Load `Settings` from a YAML file. A missing file yields the defaults;
/// a present but unparseable file is an error.
pub fn load(path: &Path) -> Result<Settings, String> {
    if !path.exists() {
        return Ok(default_settings());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    parse(&content)
}

/// Save `Settings` to a YAML file.
pub fn save(path: &Path, settings: &Settings) -> Result<(), String> {
    let content = serde_yaml::to_string(settings)
        .map_err(|e| format!("cannot serialize settings: {}", e))?;
    std::fs::write(path, content)
        .map_err(|e| format!("cannot write {}: {}", path.display(), e))
}

/// Parse settings from a YAML string. Absent fields fall back to defaults.
pub fn parse(content: &str) -> Result<Settings, String> {
    serde_yaml::from_str(content).map_err(|e| format!("invalid settings: {}", e))
}
