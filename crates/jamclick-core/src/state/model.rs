//! Session state model.
//!
//! [`SessionState`] is the replicated record of a jam session. The host's
//! copy is the reference; every other client holds a replica that changes
//! only through [`SessionState::apply`].

use crate::beat_state::BeatState;
use crate::error::Error;
use crate::presence::PresenceEntry;
use crate::timing::TimeSignature;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::messages::{MetronomeSync, SongChange, SyncMessage};

/// Lifecycle of a session. `Ended` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Waiting,
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Ended
    }

    /// Whether the host may move a session from `self` to `next`.
    ///
    /// Staying in the same status is not a transition; callers treat it as
    /// a no-op before asking.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Waiting, Active) | (Active, Paused) | (Paused, Active) | (Active, Ended) | (Paused, Ended)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(SessionStatus::Waiting),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(Error::InvalidValue(format!("unknown session status '{other}'"))),
        }
    }
}

/// Whether the local client authors session-wide changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Host,
    Follower,
}

/// Result of applying a received message to the local replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The replica changed.
    Applied {
        /// Transport flag a follower should now follow, if the message carried one.
        transport: Option<bool>,
        /// The message moved the session into `Ended`.
        ended: bool,
    },
    /// Valid message, nothing to change.
    Unchanged,
    /// The message was dropped.
    Ignored(&'static str),
}

/// Full shared state of a jam session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub host_id: String,
    pub status: SessionStatus,
    pub beat_state: BeatState,
    pub current_song_index: Option<u32>,
    pub current_song_id: Option<String>,
    pub current_song_title: Option<String>,
    pub current_song_artist: Option<String>,
    /// Last transport flag broadcast by the host.
    #[serde(default)]
    pub is_playing: bool,
}

impl SessionState {
    /// A fresh session in `Waiting` with default beat state.
    pub fn new(id: impl Into<String>, host_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host_id: host_id.into(),
            status: SessionStatus::Waiting,
            beat_state: BeatState::default(),
            current_song_index: None,
            current_song_id: None,
            current_song_title: None,
            current_song_artist: None,
            is_playing: false,
        }
    }

    pub fn is_host(&self, participant_id: &str) -> bool {
        self.host_id == participant_id
    }

    pub fn is_ended(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a received message to this replica.
    ///
    /// Tempo and signature apply on every client. Transport flags apply
    /// only when `role` is [`Role::Follower`]. Once ended, everything but a
    /// repeated `ended` is ignored.
    pub fn apply(&mut self, message: &SyncMessage, role: Role) -> ApplyOutcome {
        if self.is_ended() {
            return match message {
                SyncMessage::SessionStatus(change) if change.status == SessionStatus::Ended => {
                    ApplyOutcome::Unchanged
                }
                _ => ApplyOutcome::Ignored("session has ended"),
            };
        }

        match message {
            SyncMessage::MetronomeSync(sync) => self.apply_metronome(sync, role),
            SyncMessage::SongChange(change) => {
                self.apply_song(change);
                ApplyOutcome::Applied {
                    transport: None,
                    ended: false,
                }
            }
            SyncMessage::SessionStatus(change) => {
                if change.status == self.status {
                    return ApplyOutcome::Unchanged;
                }
                // Transitions are validated by the host before publishing;
                // a replica follows the latest status it hears about.
                self.status = change.status;
                ApplyOutcome::Applied {
                    transport: None,
                    ended: change.status.is_terminal(),
                }
            }
            SyncMessage::Snapshot(snapshot) => {
                if role == Role::Host {
                    return ApplyOutcome::Unchanged;
                }
                self.apply_snapshot(&snapshot.state)
            }
            SyncMessage::SnapshotRequest(_) => ApplyOutcome::Unchanged,
        }
    }

    fn apply_metronome(&mut self, sync: &MetronomeSync, role: Role) -> ApplyOutcome {
        let signature = match TimeSignature::from_parts(
            sync.time_signature_beats,
            sync.time_signature_value,
        ) {
            Ok(signature) => signature,
            Err(_) => return ApplyOutcome::Ignored("invalid time signature"),
        };

        self.beat_state.set_bpm(sync.bpm as i64);
        if self.beat_state.time_signature != signature {
            self.beat_state.set_time_signature(signature);
        }

        let transport = match role {
            Role::Follower => {
                self.is_playing = sync.is_playing;
                Some(sync.is_playing)
            }
            Role::Host => None,
        };

        ApplyOutcome::Applied {
            transport,
            ended: false,
        }
    }

    fn apply_song(&mut self, change: &SongChange) {
        self.current_song_index = change.song_index;
        self.current_song_id = change.song_id.clone();
        self.current_song_title = change.song_title.clone();
        self.current_song_artist = change.song_artist.clone();
    }

    /// Adopt the replicated fields of `other`, keeping local preferences.
    fn apply_snapshot(&mut self, other: &SessionState) -> ApplyOutcome {
        if other.id != self.id {
            return ApplyOutcome::Ignored("snapshot for another session");
        }

        self.host_id = other.host_id.clone();
        self.status = other.status;
        self.beat_state.set_bpm(other.beat_state.bpm as i64);
        if self.beat_state.time_signature != other.beat_state.time_signature {
            self.beat_state
                .set_time_signature(other.beat_state.time_signature);
        }
        self.current_song_index = other.current_song_index;
        self.current_song_id = other.current_song_id.clone();
        self.current_song_title = other.current_song_title.clone();
        self.current_song_artist = other.current_song_artist.clone();
        self.is_playing = other.is_playing;

        let ended = other.status.is_terminal();
        ApplyOutcome::Applied {
            transport: Some(other.is_playing && !ended),
            ended,
        }
    }
}

/// Per-process state shared between the coordinator and the metronome.
#[derive(Clone, Debug)]
pub struct ClientState {
    /// Monotonically increasing version for change detection.
    pub version: u64,
    /// Local replica of the session.
    pub session: SessionState,
    /// Participant id of this client.
    pub participant_id: String,
    pub is_connected: bool,
    /// Roster from the latest presence sync.
    pub roster: Vec<PresenceEntry>,
    /// A follower waiting for a full snapshot ignores incremental updates.
    pub awaiting_snapshot: bool,
}

impl ClientState {
    pub fn new(session: SessionState, participant_id: impl Into<String>) -> Self {
        Self {
            version: 0,
            session,
            participant_id: participant_id.into(),
            is_connected: false,
            roster: Vec::new(),
            awaiting_snapshot: false,
        }
    }

    pub fn role(&self) -> Role {
        if self.session.is_host(&self.participant_id) {
            Role::Host
        } else {
            Role::Follower
        }
    }

    /// Increment the version counter.
    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}
