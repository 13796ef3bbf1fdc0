//! Durable records of relayed sessions.
//!
//! The relay keeps one [`SessionState`] replica per session and feeds it
//! the host's envelopes through the same apply path the clients use. Each
//! change is handed to a [`PersistenceWriter`], so `GET /sessions/:id`
//! reflects the live session.

use jamclick_core::{
    ApplyOutcome, Envelope, PersistenceWriter, Role, SessionState, SessionStore, SyncMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct SessionRecorder {
    store: Arc<dyn SessionStore>,
    writer: PersistenceWriter,
    replicas: Mutex<HashMap<String, SessionState>>,
}

impl SessionRecorder {
    pub fn new(store: Arc<dyn SessionStore>) -> jamclick_core::Result<Self> {
        let writer = PersistenceWriter::new(Arc::clone(&store))?;
        Ok(Self {
            store,
            writer,
            replicas: Mutex::new(HashMap::new()),
        })
    }

    /// Fold a relayed envelope into its session's record.
    ///
    /// Only envelopes from the session's host change the record. Until the
    /// relay knows the host (from the store or a snapshot whose author is
    /// the host it names), nothing is recorded.
    pub fn record(&self, envelope: &Envelope) {
        let mut replicas = self.replicas.lock().unwrap_or_else(|e| e.into_inner());
        let session_id = envelope.session_id.as_str();

        if !replicas.contains_key(session_id) {
            match self.seed(envelope) {
                Some(state) => {
                    replicas.insert(session_id.to_string(), state);
                }
                None => {
                    log::debug!(
                        "Recorder: no host known for {}, skipping {}",
                        session_id,
                        envelope.message.kind()
                    );
                    return;
                }
            }
        }
        let Some(replica) = replicas.get_mut(session_id) else {
            return;
        };

        if !replica.is_host(&envelope.sender_id) {
            return;
        }
        match replica.apply(&envelope.message, Role::Follower) {
            ApplyOutcome::Applied { .. } => self.writer.write(replica.clone()),
            ApplyOutcome::Unchanged => {}
            ApplyOutcome::Ignored(reason) => {
                log::debug!(
                    "Recorder: {} from {} ignored: {}",
                    envelope.message.kind(),
                    envelope.sender_id,
                    reason
                );
            }
        }
    }

    /// Block until every queued record has been written.
    pub fn flush(&self) {
        self.writer.flush();
    }

    fn seed(&self, envelope: &Envelope) -> Option<SessionState> {
        match self.store.load(&envelope.session_id) {
            Ok(Some(state)) => return Some(state),
            Ok(None) => {}
            Err(e) => log::warn!("Recorder: could not load {}: {}", envelope.session_id, e),
        }
        match &envelope.message {
            SyncMessage::Snapshot(snapshot)
                if snapshot.state.id == envelope.session_id
                    && snapshot.state.host_id == envelope.sender_id =>
            {
                // Apply the snapshot itself below so it is written like any
                // other change.
                Some(SessionState::new(&snapshot.state.id, &snapshot.state.host_id))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for SessionRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.replicas.lock().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("SessionRecorder")
            .field("sessions", &sessions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jamclick_core::state::{Snapshot, SongChange, StatusChange};
    use jamclick_core::{MemoryStore, SessionStatus};

    fn song(title: &str) -> SyncMessage {
        SyncMessage::SongChange(SongChange {
            song_title: Some(title.to_string()),
            ..SongChange::default()
        })
    }

    #[test]
    fn test_host_changes_are_recorded() {
        let store = MemoryStore::new();
        let recorder = SessionRecorder::new(Arc::new(store.clone())).unwrap();

        // Nothing is known about the host yet.
        recorder.record(&Envelope::new("jam", "host", song("Early")));
        recorder.flush();
        assert!(store.load("jam").unwrap().is_none());

        let mut host_state = SessionState::new("jam", "host");
        host_state.beat_state.set_bpm(132);
        recorder.record(&Envelope::new(
            "jam",
            "host",
            SyncMessage::Snapshot(Snapshot { state: host_state }),
        ));
        recorder.record(&Envelope::new("jam", "host", song("So What")));
        recorder.record(&Envelope::new("jam", "guest", song("Forged")));
        recorder.flush();

        let record = store.load("jam").unwrap().unwrap();
        assert_eq!(record.host_id, "host");
        assert_eq!(record.beat_state.bpm, 132);
        assert_eq!(record.current_song_title.as_deref(), Some("So What"));
    }

    #[test]
    fn test_snapshot_from_non_host_does_not_seed() {
        let store = MemoryStore::new();
        let recorder = SessionRecorder::new(Arc::new(store.clone())).unwrap();

        recorder.record(&Envelope::new(
            "jam",
            "guest",
            SyncMessage::Snapshot(Snapshot {
                state: SessionState::new("jam", "host"),
            }),
        ));
        recorder.flush();
        assert!(store.load("jam").unwrap().is_none());
    }

    #[test]
    fn test_stored_record_seeds_the_replica() {
        let store = MemoryStore::new();
        store.save(&SessionState::new("jam", "host")).unwrap();
        let recorder = SessionRecorder::new(Arc::new(store.clone())).unwrap();

        recorder.record(&Envelope::new(
            "jam",
            "host",
            SyncMessage::SessionStatus(StatusChange {
                status: SessionStatus::Active,
            }),
        ));
        recorder.flush();
        assert_eq!(store.load("jam").unwrap().unwrap().status, SessionStatus::Active);
    }
}
