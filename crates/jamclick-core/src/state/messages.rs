//! Wire messages broadcast on a session channel.
//!
//! Every message carries absolute state, so a receiver that misses one
//! converges on the next. Messages serialize as
//! `{"event": <kind>, "payload": {...}}` inside an [`Envelope`].

use serde::{Deserialize, Serialize};

use super::model::{SessionState, SessionStatus};

/// Tempo, signature and transport broadcast by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetronomeSync {
    pub bpm: u32,
    pub time_signature_beats: u32,
    pub time_signature_value: u32,
    pub is_playing: bool,
    /// Wall-clock milliseconds when the host published the message.
    pub start_time: u64,
}

impl MetronomeSync {
    /// Package the replicated metronome fields of `state`.
    pub fn from_state(state: &SessionState, is_playing: bool, start_time: u64) -> Self {
        let beat_state = &state.beat_state;
        Self {
            bpm: beat_state.bpm,
            time_signature_beats: beat_state.time_signature.beats,
            time_signature_value: beat_state.time_signature.note_value.as_u32(),
            is_playing,
            start_time,
        }
    }
}

/// Queue position plus denormalized song details.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongChange {
    pub song_index: Option<u32>,
    pub song_id: Option<String>,
    pub song_title: Option<String>,
    pub song_artist: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: SessionStatus,
}

/// Sent by a (re)joining follower to ask the host for a full snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub requester_id: String,
}

/// Complete session state published by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: SessionState,
}

/// A message on the session channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SyncMessage {
    MetronomeSync(MetronomeSync),
    SongChange(SongChange),
    SessionStatus(StatusChange),
    SnapshotRequest(SnapshotRequest),
    Snapshot(Snapshot),
}

impl SyncMessage {
    /// Event name as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::MetronomeSync(_) => "metronome_sync",
            SyncMessage::SongChange(_) => "song_change",
            SyncMessage::SessionStatus(_) => "session_status",
            SyncMessage::SnapshotRequest(_) => "snapshot_request",
            SyncMessage::Snapshot(_) => "snapshot",
        }
    }

    /// Whether only the session host may author this message.
    pub fn is_host_only(&self) -> bool {
        !matches!(self, SyncMessage::SnapshotRequest(_))
    }
}

/// A [`SyncMessage`] addressed to a session and signed with its sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    pub sender_id: String,
    /// Per-sender publish counter, 0 when unsequenced.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seq: u64,
    pub message: SyncMessage,
}

fn is_zero(seq: &u64) -> bool {
    *seq == 0
}

impl Envelope {
    pub fn new(
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        message: SyncMessage,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            seq: 0,
            message,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metronome_sync_wire_format() {
        let message = SyncMessage::MetronomeSync(MetronomeSync {
            bpm: 90,
            time_signature_beats: 4,
            time_signature_value: 4,
            is_playing: true,
            start_time: 1_700_000_000_000,
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "metronome_sync",
                "payload": {
                    "bpm": 90,
                    "time_signature_beats": 4,
                    "time_signature_value": 4,
                    "is_playing": true,
                    "start_time": 1_700_000_000_000u64
                }
            })
        );
        assert_eq!(message.kind(), "metronome_sync");
    }

    #[test]
    fn test_song_change_parses_nulls() {
        let message: SyncMessage = serde_json::from_value(json!({
            "event": "song_change",
            "payload": {
                "song_index": 2,
                "song_id": "id-3",
                "song_title": "Song C",
                "song_artist": null
            }
        }))
        .unwrap();
        assert_eq!(
            message,
            SyncMessage::SongChange(SongChange {
                song_index: Some(2),
                song_id: Some("id-3".to_string()),
                song_title: Some("Song C".to_string()),
                song_artist: None,
            })
        );
    }

    #[test]
    fn test_status_message_and_envelope() {
        let envelope = Envelope::new(
            "session-1",
            "host",
            SyncMessage::SessionStatus(StatusChange {
                status: SessionStatus::Ended,
            }),
        );
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(text.contains(r#""message":{"event":"session_status","payload":{"status":"ended"}}"#));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
        assert!(!text.contains("seq"));

        let sequenced = envelope.with_seq(7);
        let text = serde_json::to_string(&sequenced).unwrap();
        assert!(text.contains(r#""seq":7"#));
        assert_eq!(serde_json::from_str::<Envelope>(&text).unwrap().seq, 7);
    }

    #[test]
    fn test_host_only_kinds() {
        let request = SyncMessage::SnapshotRequest(SnapshotRequest {
            requester_id: "f".to_string(),
        });
        assert!(!request.is_host_only());
        assert!(SyncMessage::SongChange(SongChange::default()).is_host_only());
    }
}
