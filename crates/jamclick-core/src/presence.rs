//! Live participant roster.
//!
//! The transport owns the presence table; [`PresenceTracker`] only mirrors
//! it. Each presence sync replaces the whole roster, so a participant who
//! is missing from a sync has left. There is no explicit leave message.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One tracked participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub participant_id: String,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    /// Wall-clock milliseconds when the participant came online.
    pub online_at: u64,
}

impl PresenceEntry {
    pub fn new(
        participant_id: impl Into<String>,
        username: impl Into<String>,
        display_name: impl Into<String>,
        online_at: u64,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            username: username.into(),
            display_name: display_name.into(),
            avatar_ref: None,
            online_at,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// Participants that appeared or disappeared between two syncs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

impl RosterChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

/// Mirrors the transport's presence table and republishes it to observers.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    roster: Vec<PresenceEntry>,
    observers: Vec<Sender<Vec<PresenceEntry>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with `entries`.
    ///
    /// The roster is ordered by `online_at`, then participant id. A
    /// participant present with several connections is listed once, with
    /// its earliest `online_at`.
    pub fn sync(&mut self, mut entries: Vec<PresenceEntry>) -> RosterChange {
        entries.sort_by(|a, b| {
            a.online_at
                .cmp(&b.online_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.participant_id.clone()));

        let before: HashSet<&str> = self.roster.iter().map(|e| e.participant_id.as_str()).collect();
        let after: HashSet<&str> = entries.iter().map(|e| e.participant_id.as_str()).collect();

        let change = RosterChange {
            joined: entries
                .iter()
                .filter(|e| !before.contains(e.participant_id.as_str()))
                .map(|e| e.participant_id.clone())
                .collect(),
            left: self
                .roster
                .iter()
                .filter(|e| !after.contains(e.participant_id.as_str()))
                .map(|e| e.participant_id.clone())
                .collect(),
        };

        if !change.is_empty() {
            log::debug!(
                "[PRESENCE] {} online (joined: {:?}, left: {:?})",
                entries.len(),
                change.joined,
                change.left
            );
        }

        self.roster = entries;
        let roster = &self.roster;
        self.observers
            .retain(|observer| observer.send(roster.clone()).is_ok());
        change
    }

    /// Subscribe to roster updates. The current roster is delivered first.
    pub fn observe(&mut self) -> Receiver<Vec<PresenceEntry>> {
        let (tx, rx) = unbounded();
        let _ = tx.send(self.roster.clone());
        self.observers.push(tx);
        rx
    }

    pub fn roster(&self) -> &[PresenceEntry] {
        &self.roster
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.roster.iter().any(|e| e.participant_id == participant_id)
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }
}
