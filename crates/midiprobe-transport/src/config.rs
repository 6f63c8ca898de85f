use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::{OpenParams, ParamKey};
use crate::handle::{OpenOptions, DEFAULT_INPUT_BUFFER_SIZE};
use crate::Result;

/// Settings for one harness session, passed explicitly to the session driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Output latency in milliseconds.
    pub latency_ms: u32,
    /// Enable debug logging.
    pub verbose: bool,
    /// Driver-specific open parameters, in the order they were given.
    pub params: Vec<(ParamKey, String)>,
    /// Capacity of the input arrival buffer.
    pub input_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            verbose: false,
            params: Vec::new(),
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Validated open parameters.
    pub fn open_params(&self) -> Result<OpenParams> {
        OpenParams::try_from(self.params.clone())
    }

    /// Open options for a handle using this session's latency and parameters.
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            latency: self.latency_ms,
            params: self.params.clone(),
            buffer_size: self.input_buffer_size,
            ..OpenOptions::default()
        }
    }
}

/// Default location of the persisted session settings.
pub fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("midiprobe");
    base.push("session.json");
    Some(base)
}

/// Load settings from the default location. Returns defaults if loading fails.
pub fn load() -> SessionConfig {
    settings_path()
        .map(|path| load_from(&path))
        .unwrap_or_default()
}

/// Load settings from `path`. Returns defaults if loading fails.
pub fn load_from(path: &Path) -> SessionConfig {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::warn!(?err, path = %path.display(), "ignoring malformed session settings");
            SessionConfig::default()
        }),
        Err(_) => SessionConfig::default(),
    }
}

/// Save settings to the default location.
pub fn save(settings: &SessionConfig) {
    let Some(path) = settings_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(json) = serde_json::to_string_pretty(settings) {
        if let Err(err) = fs::write(&path, json) {
            tracing::warn!(?err, "failed to write session settings");
        }
    }
}
