//! In-process session demo: one host and N followers on a [`LocalHub`].

use anyhow::Result;
use jamclick_core::{
    bootstrap_session, Config, LocalHub, MemoryStore, NullBackend, Participant,
    PersistenceWriter, SessionStatus, SessionStore, SyncCoordinator, TimeSignature,
};
use std::sync::Arc;

const HOST: &str = "host";
const MAX_ROUNDS: usize = 32;

pub fn run(config: &Config, followers: usize, bpm: i64) -> Result<()> {
    let session_id = format!("demo-{}", uuid::Uuid::new_v4());
    let hub = LocalHub::new();
    let store = MemoryStore::new();
    let backend = NullBackend::new();

    let join = |id: &str, name: &str| {
        SyncCoordinator::new(
            bootstrap_session(&store, &session_id, HOST),
            Participant::new(id, name),
            Box::new(hub.subscribe(&session_id, id)),
            Arc::new(backend.clone()),
            config.scheduler.clone(),
        )
    };

    let mut clients = vec![join(HOST, &config.session.display_name)
        .with_persistence(PersistenceWriter::new(Arc::new(store.clone()))?)];
    clients[0].connect()?;

    {
        let host = &mut clients[0];
        host.update_session_status(SessionStatus::Active)?;
        host.set_bpm(bpm)?;
        host.set_time_signature(TimeSignature::from_parts(3, 4)?)?;
        host.change_song(Some(0), Some("song-1"), Some("Blue in Green"), Some("Miles Davis"))?;
        host.start()?;
    }
    settle(&mut clients);

    for n in 1..=followers {
        let id = format!("follower-{n}");
        let mut follower = join(&id, &format!("Follower {n}"));
        follower.connect()?;
        clients.push(follower);
        settle(&mut clients);
    }

    println!("Session {}", session_id);
    report(&clients);

    log::info!("Host ends the session");
    clients[0].update_session_status(SessionStatus::Ended)?;
    settle(&mut clients);
    report(&clients);

    for client in clients.iter_mut() {
        client.leave();
    }
    // Dropping the host flushes its persistence writer.
    drop(clients);

    if let Some(record) = store.load(&session_id)? {
        println!(
            "Stored record: {} at {} bpm, status {}",
            record.id, record.beat_state.bpm, record.status
        );
    }
    println!("Clicks scheduled: {}", backend.clicks());
    Ok(())
}

/// Pump every client until nobody has pending events.
fn settle(clients: &mut [SyncCoordinator]) {
    for _ in 0..MAX_ROUNDS {
        let handled: usize = clients.iter_mut().map(SyncCoordinator::pump).sum();
        if handled == 0 {
            break;
        }
    }
}

fn report(clients: &[SyncCoordinator]) {
    for client in clients {
        let session = client.session();
        println!(
            "  {:<12} {:?}  {:>3} bpm {}  {:<7} playing={} song={} online={}",
            client.participant().id,
            client.role(),
            session.beat_state.bpm,
            session.beat_state.time_signature,
            session.status.to_string(),
            client.is_running(),
            session.current_song_title.as_deref().unwrap_or("-"),
            client.roster().len(),
        );
    }
}
