//! State manager for thread-safe state access.
//!
//! The [`StateManager`] provides synchronized access to the per-process
//! [`ClientState`]. It uses an RwLock to allow multiple readers (the
//! scheduling worker clones the beat state every pass) or a single writer.

use std::sync::{Arc, RwLock};

use super::model::{ClientState, Role, SessionState, SessionStatus};
use crate::beat_state::BeatState;
use crate::presence::PresenceEntry;

/// Thread-safe manager for the client state.
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<ClientState>>,
}

impl StateManager {
    /// Create a state manager with a specific initial state.
    pub fn with_state(state: ClientState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// A solo client that hosts its own session.
    pub fn standalone(beat_state: BeatState) -> Self {
        let mut session = SessionState::new("local", "local");
        session.beat_state = beat_state;
        Self::with_state(ClientState::new(session, "local"))
    }

    /// Read the state with a closure.
    ///
    /// This acquires a read lock for the duration of the closure.
    pub fn with_state_read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ClientState) -> R,
    {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    /// Write to the state with a closure.
    ///
    /// This acquires an exclusive write lock for the duration of the closure.
    pub fn with_state_write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ClientState) -> R,
    {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Get a clone of the current state.
    pub fn snapshot(&self) -> ClientState {
        self.with_state_read(|s| s.clone())
    }

    /// Clone of the session replica.
    pub fn session(&self) -> SessionState {
        self.with_state_read(|s| s.session.clone())
    }

    /// Clone of the beat state, consistent with respect to any writer.
    pub fn beat_state(&self) -> BeatState {
        self.with_state_read(|s| s.session.beat_state.clone())
    }

    pub fn status(&self) -> SessionStatus {
        self.with_state_read(|s| s.session.status)
    }

    pub fn role(&self) -> Role {
        self.with_state_read(|s| s.role())
    }

    pub fn is_connected(&self) -> bool {
        self.with_state_read(|s| s.is_connected)
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.with_state_read(|s| s.roster.clone())
    }

    /// Get the state version.
    pub fn version(&self) -> u64 {
        self.with_state_read(|s| s.version)
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_is_host() {
        let manager = StateManager::standalone(BeatState::default());
        assert_eq!(manager.role(), Role::Host);
        assert_eq!(manager.beat_state().bpm, 120);
        assert_eq!(manager.status(), SessionStatus::Waiting);
    }

    #[test]
    fn test_state_manager_write() {
        let manager = StateManager::standalone(BeatState::default());
        manager.with_state_write(|s| {
            s.session.beat_state.set_bpm(140);
            s.bump_version();
        });
        assert_eq!(manager.beat_state().bpm, 140);
        assert_eq!(manager.version(), 1);
    }

    #[test]
    fn test_state_manager_clone_shares_state() {
        let manager1 = StateManager::standalone(BeatState::default());
        let manager2 = manager1.clone();
        manager1.with_state_write(|s| s.session.beat_state.set_bpm(150));
        assert_eq!(manager2.beat_state().bpm, 150);
    }
}
