//! Session channel: broadcast plus presence over one topic per session.
//!
//! [`SessionChannel`] is the seam between the sync protocol and a
//! transport. Events arrive on a crossbeam receiver. [`LocalHub`] is the
//! in-process transport used by tests, the demo and the websocket relay.

use crate::presence::PresenceEntry;
use crate::state::Envelope;
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Something a subscriber hears on its channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A message broadcast by any subscriber, including this one.
    Broadcast(Envelope),
    /// The complete presence table of the session.
    PresenceSync(Vec<PresenceEntry>),
    Connected,
    Disconnected,
}

/// Pub/sub plus presence for a single session.
pub trait SessionChannel: Send + Sync {
    fn session_id(&self) -> &str;

    /// Receiver of every event for this subscription.
    fn events(&self) -> Receiver<ChannelEvent>;

    /// Publish to every subscriber, the sender included.
    fn broadcast(&self, envelope: Envelope) -> Result<()>;

    /// Announce (or refresh) this subscriber's presence.
    fn track(&self, presence: PresenceEntry) -> Result<()>;

    /// Current presence table.
    fn presence(&self) -> Vec<PresenceEntry>;

    /// Leave the topic. Idempotent.
    fn unsubscribe(&self);

    fn is_connected(&self) -> bool;
}

struct Subscriber {
    participant_id: String,
    tx: Sender<ChannelEvent>,
    connected: bool,
    presence: Option<PresenceEntry>,
}

#[derive(Default)]
struct Topic {
    subscribers: BTreeMap<u64, Subscriber>,
}

impl Topic {
    fn presence(&self) -> Vec<PresenceEntry> {
        self.subscribers
            .values()
            .filter(|s| s.connected)
            .filter_map(|s| s.presence.clone())
            .collect()
    }

    fn publish(&self, event: &ChannelEvent) {
        for subscriber in self.subscribers.values().filter(|s| s.connected) {
            let _ = subscriber.tx.send(event.clone());
        }
    }

    fn publish_presence(&self) {
        self.publish(&ChannelEvent::PresenceSync(self.presence()));
    }
}

#[derive(Default)]
struct HubInner {
    topics: HashMap<String, Topic>,
    next_id: u64,
}

/// In-process broadcast and presence hub keyed by session id.
///
/// Every event for a subscriber is sent while the hub lock is held, so
/// each subscriber observes broadcasts in publish order.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the topic of `session_id` as `participant_id`.
    pub fn subscribe(&self, session_id: &str, participant_id: &str) -> LocalChannel {
        let (tx, rx) = unbounded();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let _ = tx.send(ChannelEvent::Connected);
        inner
            .topics
            .entry(session_id.to_string())
            .or_default()
            .subscribers
            .insert(
                id,
                Subscriber {
                    participant_id: participant_id.to_string(),
                    tx,
                    connected: true,
                    presence: None,
                },
            );
        log::debug!("[HUB] {} subscribed to {}", participant_id, session_id);

        LocalChannel {
            hub: self.clone(),
            session_id: session_id.to_string(),
            id,
            rx,
        }
    }

    /// Presence table of a session (empty if unknown).
    pub fn presence(&self, session_id: &str) -> Vec<PresenceEntry> {
        self.lock()
            .topics
            .get(session_id)
            .map(Topic::presence)
            .unwrap_or_default()
    }

    /// Sessions that currently have subscribers.
    pub fn sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.lock().topics.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Simulate transport loss for every connection of a participant.
    ///
    /// The participant's presence is dropped; remaining subscribers get a
    /// presence sync and the participant gets [`ChannelEvent::Disconnected`].
    pub fn drop_connection(&self, session_id: &str, participant_id: &str) {
        let mut inner = self.lock();
        let Some(topic) = inner.topics.get_mut(session_id) else {
            return;
        };
        let mut dropped = false;
        for subscriber in topic.subscribers.values_mut() {
            if subscriber.participant_id == participant_id && subscriber.connected {
                subscriber.connected = false;
                subscriber.presence = None;
                let _ = subscriber.tx.send(ChannelEvent::Disconnected);
                dropped = true;
            }
        }
        if dropped {
            log::info!("[HUB] {} lost connection to {}", participant_id, session_id);
            topic.publish_presence();
        }
    }

    /// Reconnect a participant dropped with [`LocalHub::drop_connection`].
    pub fn restore_connection(&self, session_id: &str, participant_id: &str) {
        let mut inner = self.lock();
        let Some(topic) = inner.topics.get_mut(session_id) else {
            return;
        };
        for subscriber in topic.subscribers.values_mut() {
            if subscriber.participant_id == participant_id && !subscriber.connected {
                subscriber.connected = true;
                let _ = subscriber.tx.send(ChannelEvent::Connected);
                log::info!("[HUB] {} reconnected to {}", participant_id, session_id);
            }
        }
    }

    fn with_subscriber<R>(
        &self,
        session_id: &str,
        id: u64,
        f: impl FnOnce(&mut Topic, u64) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        let topic = inner.topics.get_mut(session_id)?;
        if !topic.subscribers.contains_key(&id) {
            return None;
        }
        Some(f(topic, id))
    }
}

impl std::fmt::Debug for LocalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHub")
            .field("sessions", &self.sessions())
            .finish()
    }
}

/// One subscription to a [`LocalHub`] topic. Unsubscribes on drop.
pub struct LocalChannel {
    hub: LocalHub,
    session_id: String,
    id: u64,
    rx: Receiver<ChannelEvent>,
}

impl SessionChannel for LocalChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn events(&self) -> Receiver<ChannelEvent> {
        self.rx.clone()
    }

    fn broadcast(&self, envelope: Envelope) -> Result<()> {
        if envelope.session_id != self.session_id {
            return Err(Error::Channel(format!(
                "envelope for session '{}' sent on '{}'",
                envelope.session_id, self.session_id
            )));
        }
        self.hub
            .with_subscriber(&self.session_id, self.id, |topic, id| {
                if !topic.subscribers[&id].connected {
                    return Err(Error::Disconnected);
                }
                log::trace!("[HUB] {} -> {}", envelope.sender_id, envelope.message.kind());
                topic.publish(&ChannelEvent::Broadcast(envelope));
                Ok(())
            })
            .unwrap_or(Err(Error::Disconnected))
    }

    fn track(&self, presence: PresenceEntry) -> Result<()> {
        self.hub
            .with_subscriber(&self.session_id, self.id, |topic, id| {
                let Some(subscriber) = topic.subscribers.get_mut(&id) else {
                    return Err(Error::Disconnected);
                };
                if !subscriber.connected {
                    return Err(Error::Disconnected);
                }
                subscriber.presence = Some(presence);
                topic.publish_presence();
                Ok(())
            })
            .unwrap_or(Err(Error::Disconnected))
    }

    fn presence(&self) -> Vec<PresenceEntry> {
        self.hub.presence(&self.session_id)
    }

    fn unsubscribe(&self) {
        let mut inner = self.hub.lock();
        let Some(topic) = inner.topics.get_mut(&self.session_id) else {
            return;
        };
        let Some(subscriber) = topic.subscribers.remove(&self.id) else {
            return;
        };
        log::debug!("[HUB] {} unsubscribed from {}", subscriber.participant_id, self.session_id);
        if topic.subscribers.is_empty() {
            inner.topics.remove(&self.session_id);
        } else if subscriber.presence.is_some() {
            topic.publish_presence();
        }
    }

    fn is_connected(&self) -> bool {
        self.hub
            .with_subscriber(&self.session_id, self.id, |topic, id| {
                topic.subscribers[&id].connected
            })
            .unwrap_or(false)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SongChange, SyncMessage};

    fn song(index: u32) -> SyncMessage {
        SyncMessage::SongChange(SongChange {
            song_index: Some(index),
            ..SongChange::default()
        })
    }

    fn drain(rx: &Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn test_broadcast_reaches_sender_in_order() {
        let hub = LocalHub::new();
        let a = hub.subscribe("s", "a");
        let b = hub.subscribe("s", "b");
        let (a_rx, b_rx) = (a.events(), b.events());
        drain(&a_rx);
        drain(&b_rx);

        for i in 0..3 {
            a.broadcast(Envelope::new("s", "a", song(i))).unwrap();
        }

        for rx in [&a_rx, &b_rx] {
            let indices: Vec<_> = drain(rx)
                .into_iter()
                .filter_map(|event| match event {
                    ChannelEvent::Broadcast(Envelope {
                        message: SyncMessage::SongChange(change),
                        ..
                    }) => change.song_index,
                    _ => None,
                })
                .collect();
            assert_eq!(indices, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_sessions_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.subscribe("one", "a");
        let b = hub.subscribe("two", "b");
        drain(&b.events());
        a.broadcast(Envelope::new("one", "a", song(1))).unwrap();
        assert!(drain(&b.events()).is_empty());
        assert!(a.broadcast(Envelope::new("two", "a", song(1))).is_err());
    }

    #[test]
    fn test_track_and_unsubscribe_publish_presence() {
        let hub = LocalHub::new();
        let a = hub.subscribe("s", "a");
        let b = hub.subscribe("s", "b");
        let a_rx = a.events();

        a.track(PresenceEntry::new("a", "a", "A", 1)).unwrap();
        b.track(PresenceEntry::new("b", "b", "B", 2)).unwrap();
        assert_eq!(hub.presence("s").len(), 2);

        drop(b);
        let last_sync = drain(&a_rx)
            .into_iter()
            .filter_map(|event| match event {
                ChannelEvent::PresenceSync(entries) => Some(entries),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_sync.len(), 1);
        assert_eq!(last_sync[0].participant_id, "a");
    }

    #[test]
    fn test_dropped_connection_cannot_broadcast() {
        let hub = LocalHub::new();
        let a = hub.subscribe("s", "a");
        let b = hub.subscribe("s", "b");
        b.track(PresenceEntry::new("b", "b", "B", 2)).unwrap();
        let b_rx = b.events();
        drain(&b_rx);

        hub.drop_connection("s", "b");
        assert!(!b.is_connected());
        assert!(matches!(
            b.broadcast(Envelope::new("s", "b", song(0))),
            Err(Error::Disconnected)
        ));
        assert!(hub.presence("s").is_empty());

        a.broadcast(Envelope::new("s", "a", song(4))).unwrap();
        assert_eq!(drain(&b_rx), vec![ChannelEvent::Disconnected]);

        hub.restore_connection("s", "b");
        assert!(b.is_connected());
        assert_eq!(drain(&b_rx), vec![ChannelEvent::Connected]);
    }

    #[test]
    fn test_channel_event_wire_format() {
        let json = serde_json::to_string(&ChannelEvent::Connected).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);
    }
}
