use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::AudioFormat;
use crate::session_config::ConfigError;
use crate::streaming::DEFAULT_ENDPOINT;

const SETTINGS_DIR_NAME: &str = "interview-coach";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Native-audio model used by the interview coach
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live model identifier (with or without the `models/` prefix).
    pub model: String,

    /// WebSocket endpoint of the live API.
    pub endpoint: String,

    /// Sample rate of both directions of the conversation.
    pub sample_rate: u32,

    /// Samples per microphone block (one outbound frame per block).
    pub capture_block_size: usize,

    /// Encoded frames that may wait for the socket before new blocks are dropped.
    pub outbound_queue_frames: usize,

    /// Playback backlog (in chunks) above which a warning is logged. Never rejects audio.
    pub playback_soft_capacity: usize,

    /// Connection attempts before `open` gives up.
    pub connect_retries: u32,

    /// End an active session after this long without hearing from the model.
    /// Off when unset: conversational turns have no fixed upper bound.
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sample_rate: 24_000,
            capture_block_size: 4096,
            outbound_queue_frames: 32,
            playback_soft_capacity: 256,
            connect_retries: 3,
            inactivity_timeout_secs: None,
        }
    }
}

impl AppSettings {
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            block_size: self.capture_block_size,
        }
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingModel);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.capture_block_size == 0 {
            return Err(ConfigError::Settings(
                "capture_block_size must be greater than zero".to_string(),
            ));
        }
        if self.outbound_queue_frames == 0 {
            return Err(ConfigError::Settings(
                "outbound_queue_frames must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `<config_dir>/interview-coach/settings.json`
pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::Settings("Could not determine config directory".to_string())
    })?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::Settings(format!(
                "Failed to create config directory {:?}: {}",
                parent, e
            ))
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)
        .map_err(|e| ConfigError::Settings(format!("Serialize settings: {}", e)))?;

    // Write to a temp file in the same directory, then rename over the original
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|e| {
        ConfigError::Settings(format!("Write temp settings {:?}: {}", tmp_path, e))
    })?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ConfigError::Settings(format!(
                    "Remove existing settings file {:?}: {}",
                    path, e
                )));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        ConfigError::Settings(format!(
            "Rename temp settings {:?} to {:?}: {}",
            tmp_path, path, e
        ))
    })?;
    Ok(())
}
