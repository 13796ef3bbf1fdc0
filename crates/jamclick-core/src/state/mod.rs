//! Session state and its replication messages.
//!
//! - [`SessionState`] - The replicated session record
//! - [`SyncMessage`] / [`Envelope`] - Everything broadcast on a session channel
//! - [`StateManager`] - Thread-safe access to the per-process [`ClientState`]

mod manager;
mod messages;
mod model;

pub use manager::StateManager;
pub use messages::{
    Envelope, MetronomeSync, Snapshot, SnapshotRequest, SongChange, StatusChange, SyncMessage,
};
pub use model::{ApplyOutcome, ClientState, Role, SessionState, SessionStatus};
