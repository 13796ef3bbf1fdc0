//! Configuration file support for jamclick
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/jamclick/config.toml`
//! - macOS: `~/Library/Application Support/jamclick/config.toml`
//! - Windows: `%APPDATA%\jamclick\config.toml`

use crate::audio_device::AudioConfig;
use crate::beat_state::BeatState;
use crate::click::ClickConfig;
use crate::error::{Error, Result};
use crate::timing::{SchedulerTiming, Subdivision, TimeSignature};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lookahead scheduler timing
    pub scheduler: SchedulerTiming,
    /// Output device selection
    pub audio: AudioConfig,
    /// Click timbres
    pub click: ClickConfig,
    /// Starting metronome settings
    pub metronome: MetronomeDefaults,
    /// Session relay and store settings
    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(e) => {
                log::warn!("Ignoring unreadable config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "jamclick") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG)?;
        Ok(path)
    }
}

const DEFAULT_CONFIG: &str = r#"# jamclick configuration file

[scheduler]
# How far ahead of the audio clock clicks are scheduled
lookahead_ms = 100
# How often the scheduling thread wakes up
interval_ms = 25
# Delay between start and the first click
start_offset_ms = 50

[audio]
# Output device name (substring match); omit for the system default
# output_device = "USB Audio"
# sample_rate = 48000

[metronome]
bpm = 120
subdivision = "none"
volume = 0.8

[metronome.time_signature]
beats = 4
note_value = 4

[click.accent]
frequency_hz = 1500.0
gain = 1.0
duration_ms = 30.0

[click.beat]
frequency_hz = 1000.0
gain = 0.7
duration_ms = 30.0

[click.subdivision]
frequency_hz = 800.0
gain = 0.4
duration_ms = 20.0

[session]
# Port of the websocket relay started by `jam serve`
server_port = 1607
# Name shown to other participants
display_name = "jammer"
# Where session records are stored; defaults to the platform data dir
# data_dir = "/var/lib/jamclick"
"#;

/// Metronome settings used when no session state is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeDefaults {
    pub bpm: u32,
    pub subdivision: Subdivision,
    pub volume: f32,
    pub time_signature: TimeSignature,
}

impl Default for MetronomeDefaults {
    fn default() -> Self {
        let beat_state = BeatState::default();
        Self {
            bpm: beat_state.bpm,
            subdivision: beat_state.subdivision,
            volume: beat_state.volume,
            time_signature: beat_state.time_signature,
        }
    }
}

impl MetronomeDefaults {
    /// Build a beat state from these settings, clamping out-of-range values.
    pub fn to_beat_state(&self) -> BeatState {
        let mut state = BeatState::default();
        state.set_bpm(self.bpm as i64);
        state.set_time_signature(self.time_signature);
        state.set_subdivision(self.subdivision);
        state.set_volume(self.volume);
        state
    }
}

/// Relay and session store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Directory of the JSON session store (None = platform data dir)
    pub data_dir: Option<PathBuf>,
    /// Port of the websocket relay
    pub server_port: u16,
    /// Name shown in presence
    pub display_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            server_port: 1607,
            display_name: "jammer".to_string(),
        }
    }
}

impl SessionSettings {
    /// The configured data directory, or `<data_dir>/jamclick/sessions`.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("", "", "jamclick")
            .map(|dirs| dirs.data_dir().join("sessions"))
            .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))
    }
}
