//! Error types for jamclick-core

use crate::state::SessionStatus;
use thiserror::Error;

/// Result type alias for jamclick-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in jamclick-core
#[derive(Debug, Error)]
pub enum Error {
    /// No output device could be found
    #[error("No audio output device available")]
    NoOutputDevice,

    /// The audio device exists but could not be opened or configured
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// The output stream could not be built or started
    #[error("Audio stream error: {0}")]
    Stream(String),

    /// A host-only operation was attempted by a follower
    #[error("Only the session host can {0}")]
    NotHost(&'static str),

    /// The session has ended and accepts no further mutations
    #[error("Session has ended")]
    SessionEnded,

    /// A session status transition that the state machine forbids
    #[error("Invalid session status transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// The channel is not connected
    #[error("Session channel is disconnected")]
    Disconnected,

    /// Channel/transport error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Durable store error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value outside the accepted domain (e.g. a note value of 3)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
