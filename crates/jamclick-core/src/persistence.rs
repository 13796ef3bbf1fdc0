//! Durable session records.
//!
//! Writes are best effort: the host hands every post-broadcast
//! [`SessionState`] to a [`PersistenceWriter`], which saves it on a
//! background thread. A failed write is logged and never retried; the live
//! state is not rolled back.

use crate::state::SessionState;
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Storage for the latest record of each session.
pub trait SessionStore: Send + Sync {
    fn save(&self, state: &SessionState) -> Result<()>;

    /// The stored record of `session_id`, if any.
    fn load(&self, session_id: &str) -> Result<Option<SessionState>>;
}

/// In-memory store for tests and the demo.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, state: &SessionState) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        records.insert(state.id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::Persistence("memory store lock poisoned".to_string()))?;
        Ok(records.get(session_id).cloned())
    }
}

/// One pretty-printed JSON file per session under a data directory.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the record of `session_id`.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl SessionStore for JsonFileStore {
    fn save(&self, state: &SessionState) -> Result<()> {
        let path = self.path_for(&state.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        log::trace!("[STORE] Saved {} to {}", state.id, path.display());
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

enum Job {
    Save(Box<SessionState>),
    Flush(Sender<()>),
}

/// Fire-and-forget writer in front of a [`SessionStore`].
///
/// Dropping the writer saves everything already queued, then joins the
/// background thread.
pub struct PersistenceWriter {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceWriter {
    pub fn new(store: Arc<dyn SessionStore>) -> Result<Self> {
        let (tx, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("jamclick-persistence".to_string())
            .spawn(move || {
                for job in rx {
                    match job {
                        Job::Save(state) => {
                            if let Err(e) = store.save(&state) {
                                log::warn!("[STORE] Failed to persist session {}: {}", state.id, e);
                            }
                        }
                        Job::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue `state` for saving. Never blocks.
    pub fn write(&self, state: SessionState) {
        let Some(tx) = &self.tx else {
            return;
        };
        if tx.send(Job::Save(Box::new(state))).is_err() {
            log::warn!("[STORE] Persistence thread is gone, dropping write");
        }
    }

    /// Block until every write queued so far has been attempted.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for PersistenceWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionStatus;

    struct FailingStore;

    impl SessionStore for FailingStore {
        fn save(&self, _state: &SessionState) -> Result<()> {
            Err(Error::Persistence("disk full".to_string()))
        }

        fn load(&self, _session_id: &str) -> Result<Option<SessionState>> {
            Ok(None)
        }
    }

    #[test]
    fn test_json_store_saves_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions")).unwrap();
        assert!(store.load("jam-1").unwrap().is_none());

        let mut state = SessionState::new("jam-1", "host");
        state.status = SessionStatus::Active;
        state.beat_state.set_bpm(97);
        store.save(&state).unwrap();

        assert_eq!(store.load("jam-1").unwrap(), Some(state));
        assert!(store.path_for("jam-1").exists());
    }

    #[test]
    fn test_json_store_sanitizes_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let path = store.path_for("../escape/me");
        assert_eq!(path.parent(), Some(dir.path()));
        assert_eq!(path.file_name().unwrap(), "___escape_me.json");
    }

    #[test]
    fn test_writer_drains_on_drop() {
        let store = MemoryStore::new();
        let writer = PersistenceWriter::new(Arc::new(store.clone())).unwrap();
        for bpm in [100, 110, 120] {
            let mut state = SessionState::new("s", "h");
            state.beat_state.set_bpm(bpm);
            writer.write(state);
        }
        drop(writer);
        assert_eq!(store.load("s").unwrap().unwrap().beat_state.bpm, 120);
    }

    #[test]
    fn test_writer_survives_failing_store() {
        let writer = PersistenceWriter::new(Arc::new(FailingStore)).unwrap();
        writer.write(SessionState::new("s", "h"));
        writer.flush();
        writer.write(SessionState::new("s", "h"));
        writer.flush();
    }
}
