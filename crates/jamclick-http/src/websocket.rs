//! WebSocket relay onto the in-process session hub.
//!
//! Each socket becomes one subscription of `/sessions/:id`. Hub events are
//! forwarded to the client as JSON [`ChannelEvent`]s; client frames either
//! broadcast an envelope or track presence. A client speaks only for its
//! own participant id on its own session. Closing the socket unsubscribes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use jamclick_core::{ChannelEvent, Envelope, PresenceEntry, SessionChannel};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{AppState, SessionRecorder};

/// Events buffered per socket before the hub bridge waits for the client.
const SOCKET_QUEUE_LEN: usize = 256;

/// Query parameters of the websocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Participant id; a random one is assigned when absent.
    pub participant: Option<String>,
}

/// Frame sent by a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Broadcast { envelope: Envelope },
    Track { presence: PresenceEntry },
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let participant = params
        .participant
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, participant))
}

/// Forward a hub subscription into the async world.
///
/// The bridge thread ends once the subscription is dropped or the async
/// side stops listening.
pub fn bridge_events(
    events: crossbeam_channel::Receiver<ChannelEvent>,
) -> mpsc::Receiver<ChannelEvent> {
    let (tx, rx) = mpsc::channel(SOCKET_QUEUE_LEN);
    std::thread::spawn(move || {
        for event in events {
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String, participant: String) {
    let (mut sender, mut receiver) = socket.split();
    let channel = state.hub.subscribe(&session_id, &participant);
    let mut events = bridge_events(channel.events());
    log::info!("Relay: {} connected to {}", participant, session_id);

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let msg = match serde_json::to_string(&event) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Relay: failed to encode event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => handle_frame(&state.recorder, &channel, &participant, frame),
            Err(e) => log::warn!("Relay: bad frame from {}: {}", participant, e),
        }
    }

    channel.unsubscribe();
    send_task.abort();
    log::info!("Relay: {} left {}", participant, session_id);
}

/// Apply one client frame to its subscription.
pub fn handle_frame(
    recorder: &SessionRecorder,
    channel: &dyn SessionChannel,
    participant: &str,
    frame: ClientFrame,
) {
    let result = match frame {
        ClientFrame::Broadcast { envelope } => {
            if envelope.sender_id != participant {
                log::warn!(
                    "Relay: {} tried to send as {}, dropped",
                    participant,
                    envelope.sender_id
                );
                return;
            }
            if envelope.session_id != channel.session_id() {
                log::warn!(
                    "Relay: {} sent to {} on {}, dropped",
                    participant,
                    envelope.session_id,
                    channel.session_id()
                );
                return;
            }
            recorder.record(&envelope);
            channel.broadcast(envelope)
        }
        ClientFrame::Track { presence } => {
            if presence.participant_id != participant {
                log::warn!(
                    "Relay: {} tried to track as {}, dropped",
                    participant,
                    presence.participant_id
                );
                return;
            }
            channel.track(presence)
        }
    };
    if let Err(e) = result {
        log::warn!("Relay: frame from {} failed: {}", participant, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::sessions::get_session;
    use axum::Json;
    use jamclick_core::state::{Snapshot, SongChange};
    use jamclick_core::{LocalHub, MemoryStore, SessionState, SyncMessage};

    fn recorder() -> SessionRecorder {
        SessionRecorder::new(Arc::new(MemoryStore::new())).unwrap()
    }

    fn drain(rx: &crossbeam_channel::Receiver<ChannelEvent>) {
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_client_frame_parsing() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"action":"track","presence":{"participant_id":"a","username":"a","display_name":"A","online_at":5}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Track { presence } if presence.online_at == 5));
    }

    #[test]
    fn test_spoofed_sender_is_dropped() {
        let recorder = recorder();
        let hub = LocalHub::new();
        let a = hub.subscribe("s", "a");
        let rx = a.events();
        drain(&rx);

        let message = SyncMessage::SongChange(SongChange::default());
        handle_frame(
            &recorder,
            &a,
            "a",
            ClientFrame::Broadcast {
                envelope: Envelope::new("s", "host", message.clone()),
            },
        );
        handle_frame(
            &recorder,
            &a,
            "a",
            ClientFrame::Broadcast {
                envelope: Envelope::new("other", "a", message.clone()),
            },
        );
        assert!(rx.try_recv().is_err());

        handle_frame(
            &recorder,
            &a,
            "a",
            ClientFrame::Broadcast {
                envelope: Envelope::new("s", "a", message),
            },
        );
        assert!(matches!(rx.try_recv(), Ok(ChannelEvent::Broadcast(_))));
    }

    #[test]
    fn test_presence_for_another_participant_is_dropped() {
        let recorder = recorder();
        let hub = LocalHub::new();
        let a = hub.subscribe("s", "a");
        let _b = hub.subscribe("s", "b");
        drain(&a.events());

        handle_frame(
            &recorder,
            &a,
            "a",
            ClientFrame::Track {
                presence: PresenceEntry::new("b", "b", "Not B", 1),
            },
        );
        assert!(hub.presence("s").is_empty());

        handle_frame(
            &recorder,
            &a,
            "a",
            ClientFrame::Track {
                presence: PresenceEntry::new("a", "a", "Alice", 2),
            },
        );
        let presence = hub.presence("s");
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].participant_id, "a");
    }

    #[tokio::test]
    async fn test_relayed_host_changes_reach_the_api() {
        let state = Arc::new(
            AppState::new(LocalHub::new(), Arc::new(MemoryStore::new())).unwrap(),
        );
        let host = state.hub.subscribe("jam", "host");
        let guest = state.hub.subscribe("jam", "guest");

        let send = |channel: &dyn SessionChannel, participant: &str, message: SyncMessage| {
            handle_frame(
                &state.recorder,
                channel,
                participant,
                ClientFrame::Broadcast {
                    envelope: Envelope::new("jam", participant, message),
                },
            );
        };
        send(
            &host,
            "host",
            SyncMessage::Snapshot(Snapshot {
                state: SessionState::new("jam", "host"),
            }),
        );
        send(
            &host,
            "host",
            SyncMessage::SongChange(SongChange {
                song_index: Some(2),
                song_title: Some("Footprints".to_string()),
                ..SongChange::default()
            }),
        );
        send(
            &guest,
            "guest",
            SyncMessage::SongChange(SongChange {
                song_title: Some("Not the host's pick".to_string()),
                ..SongChange::default()
            }),
        );
        state.recorder.flush();

        let Json(record) = get_session(State(state.clone()), Path("jam".to_string()))
            .await
            .unwrap();
        assert_eq!(record.current_song_index, Some(2));
        assert_eq!(record.current_song_title.as_deref(), Some("Footprints"));
    }

    #[tokio::test]
    async fn test_bridge_forwards_until_unsubscribed() {
        let hub = LocalHub::new();
        let channel = hub.subscribe("s", "a");
        let mut events = bridge_events(channel.events());

        assert_eq!(events.recv().await, Some(ChannelEvent::Connected));
        channel
            .track(PresenceEntry::new("a", "a", "A", 1))
            .unwrap();
        assert!(matches!(events.recv().await, Some(ChannelEvent::PresenceSync(p)) if p.len() == 1));

        drop(channel);
        assert_eq!(events.recv().await, None);
    }
}
