//! jamclick Core - Lookahead click scheduling and jam-session state sync.
//!
//! This crate provides the building blocks of a collaborative metronome:
//!
//! - **Timing** - Time signatures, subdivisions, scheduler timing
//! - **Beat state** - Tempo, signature, accents, silent beats, tap tempo
//! - **Scheduler** - Drift-free lookahead click scheduling against a device clock
//! - **Metronome** - The scheduling worker driving a click output
//! - **State** - Replicated session state and its wire messages
//! - **Channel** - Broadcast and presence transport seam, plus an in-process hub
//! - **Sync** - The host-authoritative session protocol
//! - **Persistence** - Best-effort durable session records
//!
//! # Architecture
//!
//! Only the session host authors tempo, signature, transport, song and
//! status changes. Every change travels as absolute state on the session
//! channel and every subscriber, the host included, applies it through
//! [`SyncCoordinator::apply_envelope`]. The [`Metronome`] reads the beat
//! state through the shared [`StateManager`] at the top of each pass.
//!
//! # Feature Flags
//!
//! - `native` (default) - cpal audio output and device enumeration

pub mod audio_device;
pub mod beat_state;
pub mod channel;
pub mod click;
pub mod config;
pub mod error;
pub mod events;
pub mod metronome;
pub mod output;
pub mod persistence;
pub mod presence;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod timing;

pub use audio_device::AudioConfig;
pub use beat_state::{BeatState, TapTempo};
pub use channel::{ChannelEvent, LocalChannel, LocalHub, SessionChannel};
pub use click::{ClickConfig, ClickMixer, ClickTone};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{BeatTick, ClickEvent, ClickRole};
pub use metronome::Metronome;
pub use output::{ClickBackend, ClickOutput, NullBackend};
pub use persistence::{JsonFileStore, MemoryStore, PersistenceWriter, SessionStore};
pub use presence::{PresenceEntry, PresenceTracker};
pub use scheduler::{ClickScheduler, SchedulePass};
pub use state::{
    ApplyOutcome, ClientState, Envelope, Role, SessionState, SessionStatus, StateManager,
    SyncMessage,
};
pub use sync::{bootstrap_session, Participant, SyncCoordinator};
pub use timing::{NoteValue, SchedulerTiming, Subdivision, TimeSignature, MAX_BPM, MIN_BPM};

// Native-only re-exports
#[cfg(feature = "native")]
pub use audio_device::{list_audio_devices, print_audio_devices, AudioDeviceInfo, CpalBackend};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_standalone_metronome_follows_live_tempo() {
        let shared = StateManager::standalone(BeatState::default());
        let backend = NullBackend::new();
        let mut metronome = Metronome::new(
            shared.clone(),
            Arc::new(backend.clone()),
            SchedulerTiming::default(),
        );
        let beats = metronome.beat_events();
        metronome.start().unwrap();

        let first = beats.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        shared.with_state_write(|s| {
            s.session.beat_state.set_bpm(300);
            s.bump_version();
        });
        let second = beats.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        metronome.stop();

        assert_eq!(first.beat, 0);
        assert_eq!(second.beat, 1);
        assert!(second.time > first.time);
    }

    #[test]
    fn test_session_wire_roundtrip_through_envelope() {
        let mut state = SessionState::new("s", "h");
        state.beat_state.set_time_signature("5/4".parse().unwrap());
        let envelope = Envelope::new(
            "s",
            "h",
            SyncMessage::Snapshot(state::Snapshot {
                state: state.clone(),
            }),
        );
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }
}
