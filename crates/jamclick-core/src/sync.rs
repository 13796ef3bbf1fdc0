//! Jam-session synchronization.
//!
//! The [`SyncCoordinator`] runs one client of a session. The host is the
//! only author of tempo, signature, transport, song and status changes.
//! Every change is broadcast as absolute state, and every subscriber
//! (including the host, which hears its own broadcast) applies received
//! messages through [`SyncCoordinator::apply_envelope`].
//!
//! # Reconnection
//!
//! A follower that (re)joins sends a `snapshot_request` and ignores
//! incremental updates until the host answers with a `snapshot`. The host
//! also publishes a snapshot whenever a new participant shows up in a
//! presence sync and after its own reconnect.

use crate::beat_state::TapTempo;
use crate::channel::{ChannelEvent, SessionChannel};
use crate::events::BeatTick;
use crate::metronome::Metronome;
use crate::output::ClickBackend;
use crate::persistence::{PersistenceWriter, SessionStore};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::state::{
    ApplyOutcome, ClientState, Envelope, MetronomeSync, Role, SessionState, SessionStatus,
    Snapshot, SnapshotRequest, SongChange, StateManager, StatusChange, SyncMessage,
};
use crate::timing::{now_millis, SchedulerTiming, Subdivision, TimeSignature};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of the local participant, announced through presence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            username: id.clone(),
            id,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    fn presence(&self, online_at: u64) -> PresenceEntry {
        PresenceEntry {
            participant_id: self.id.clone(),
            username: self.username.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
            online_at,
        }
    }
}

/// Starting state for a client: the durable record if one exists, else a
/// fresh session. A store error is logged and treated as "no record".
pub fn bootstrap_session(store: &dyn SessionStore, session_id: &str, host_id: &str) -> SessionState {
    match store.load(session_id) {
        Ok(Some(state)) => {
            log::info!(
                "[SYNC] Bootstrapped {} from store ({}, {} bpm)",
                session_id,
                state.status,
                state.beat_state.bpm
            );
            state
        }
        Ok(None) => SessionState::new(session_id, host_id),
        Err(e) => {
            log::warn!("[SYNC] Could not load session {}: {}", session_id, e);
            SessionState::new(session_id, host_id)
        }
    }
}

/// One client of a jam session.
pub struct SyncCoordinator {
    shared: StateManager,
    me: Participant,
    channel: Box<dyn SessionChannel>,
    events: Receiver<ChannelEvent>,
    metronome: Metronome,
    presence: PresenceTracker,
    writer: Option<PersistenceWriter>,
    tapper: TapTempo,
    online_at: u64,
    /// Set on transport loss; the next `Connected` triggers a rejoin.
    needs_rejoin: bool,
    /// Sequence number of the last host change applied locally.
    published_seq: u64,
}

impl SyncCoordinator {
    pub fn new(
        session: SessionState,
        me: Participant,
        channel: Box<dyn SessionChannel>,
        backend: Arc<dyn ClickBackend>,
        timing: SchedulerTiming,
    ) -> Self {
        let shared = StateManager::with_state(ClientState::new(session, me.id.clone()));
        let metronome = Metronome::new(shared.clone(), backend, timing);
        let events = channel.events();
        Self {
            shared,
            me,
            channel,
            events,
            metronome,
            presence: PresenceTracker::new(),
            writer: None,
            tapper: TapTempo::new(),
            online_at: now_millis(),
            needs_rejoin: false,
            published_seq: 0,
        }
    }

    /// Persist the session after every host broadcast.
    pub fn with_persistence(mut self, writer: PersistenceWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Announce presence and catch up with the session.
    pub fn connect(&mut self) -> Result<()> {
        let connected = self.channel.is_connected();
        self.shared.with_state_write(|s| s.is_connected = connected);
        if !connected {
            return Err(Error::Disconnected);
        }
        log::info!(
            "[SYNC] {} joined {} as {:?}",
            self.me.id,
            self.channel.session_id(),
            self.role()
        );
        self.rejoin()
    }

    fn rejoin(&mut self) -> Result<()> {
        self.needs_rejoin = false;
        self.channel.track(self.me.presence(self.online_at))?;
        match self.role() {
            Role::Host => self.publish_snapshot(),
            Role::Follower => {
                self.shared.with_state_write(|s| s.awaiting_snapshot = true);
                self.send(SyncMessage::SnapshotRequest(SnapshotRequest {
                    requester_id: self.me.id.clone(),
                }))
            }
        }
    }

    /// Handle every event already queued. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for an event, then handle everything queued.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    pub fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Broadcast(envelope) => self.apply_envelope(&envelope),
            ChannelEvent::PresenceSync(entries) => self.handle_presence(entries),
            ChannelEvent::Connected => {
                self.shared.with_state_write(|s| s.is_connected = true);
                if self.needs_rejoin {
                    log::info!("[SYNC] {} reconnected, resyncing", self.me.id);
                    if let Err(e) = self.rejoin() {
                        log::warn!("[SYNC] Rejoin failed: {}", e);
                    }
                }
            }
            ChannelEvent::Disconnected => {
                self.shared.with_state_write(|s| s.is_connected = false);
                self.needs_rejoin = true;
                log::warn!(
                    "[SYNC] {} lost the session channel; metronome keeps its last state",
                    self.me.id
                );
            }
        }
    }

    fn handle_presence(&mut self, entries: Vec<PresenceEntry>) {
        let change = self.presence.sync(entries);
        let roster = self.presence.roster().to_vec();
        self.shared.with_state_write(|s| {
            s.roster = roster;
            s.bump_version();
        });

        let newcomer = change.joined.iter().any(|id| *id != self.me.id);
        if newcomer && self.role() == Role::Host {
            log::debug!("[SYNC] New participants {:?}, publishing snapshot", change.joined);
            if let Err(e) = self.publish_snapshot() {
                log::warn!("[SYNC] Snapshot for newcomers failed: {}", e);
            }
        }
    }

    /// Apply a received envelope to the local replica.
    pub fn apply_envelope(&mut self, envelope: &Envelope) {
        let (session_id, host_id, role, awaiting) = self.shared.with_state_read(|s| {
            (
                s.session.id.clone(),
                s.session.host_id.clone(),
                s.role(),
                s.awaiting_snapshot,
            )
        });

        if envelope.session_id != session_id {
            log::warn!("[SYNC] Dropping message for session {}", envelope.session_id);
            return;
        }
        let message = &envelope.message;
        if message.is_host_only() && envelope.sender_id != host_id {
            log::warn!(
                "[SYNC] Ignoring {} from non-host {}",
                message.kind(),
                envelope.sender_id
            );
            return;
        }

        if let SyncMessage::SnapshotRequest(request) = message {
            if role == Role::Host {
                log::debug!("[SYNC] {} requested a snapshot", request.requester_id);
                if let Err(e) = self.publish_snapshot() {
                    log::warn!("[SYNC] Snapshot reply failed: {}", e);
                }
            }
            return;
        }

        // Our own echo was applied before it was sent; an older one would
        // roll back changes made since.
        if role == Role::Host
            && envelope.sender_id == self.me.id
            && envelope.seq != 0
            && envelope.seq < self.published_seq
        {
            log::debug!("[SYNC] Skipping stale echo #{} of {}", envelope.seq, message.kind());
            return;
        }

        if awaiting && role == Role::Follower && !matches!(message, SyncMessage::Snapshot(_)) {
            log::debug!("[SYNC] Awaiting snapshot, ignoring {}", message.kind());
            return;
        }

        self.apply_message(message, role);
    }

    fn apply_message(&mut self, message: &SyncMessage, role: Role) {
        let outcome = self.shared.with_state_write(|s| {
            let outcome = s.session.apply(message, role);
            if matches!(message, SyncMessage::Snapshot(_)) && !matches!(outcome, ApplyOutcome::Ignored(_)) {
                s.awaiting_snapshot = false;
            }
            if matches!(outcome, ApplyOutcome::Applied { .. }) {
                s.bump_version();
            }
            outcome
        });

        match outcome {
            ApplyOutcome::Applied { transport, ended } => {
                log::debug!("[SYNC] Applied {}", message.kind());
                if ended {
                    log::info!("[SYNC] Session ended");
                    self.metronome.stop();
                } else if let Some(playing) = transport {
                    self.follow_transport(playing);
                }
            }
            ApplyOutcome::Unchanged => {}
            ApplyOutcome::Ignored(reason) => {
                log::debug!("[SYNC] Ignored {}: {}", message.kind(), reason);
            }
        }
    }

    fn follow_transport(&mut self, playing: bool) {
        if playing {
            if let Err(e) = self.metronome.start() {
                log::error!("[SYNC] Could not follow host transport: {}", e);
            }
        } else {
            self.metronome.stop();
        }
    }

    // === Host operations ===

    /// Start the local click and tell followers to play.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_host("start the metronome")?;
        if self.metronome.is_running() && self.shared.session().is_playing {
            return Ok(());
        }
        self.metronome.start()?;
        self.set_playing(true);
        self.sync_metronome()
    }

    /// Stop the local click and tell followers to stop.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_host("stop the metronome")?;
        if !self.metronome.is_running() && !self.shared.session().is_playing {
            return Ok(());
        }
        self.metronome.stop();
        self.set_playing(false);
        self.sync_metronome()
    }

    fn set_playing(&self, playing: bool) {
        self.shared.with_state_write(|s| {
            if s.session.is_playing != playing {
                s.session.is_playing = playing;
                s.bump_version();
            }
        });
    }

    pub fn set_bpm(&mut self, bpm: i64) -> Result<u32> {
        self.ensure_host("change the tempo")?;
        let mut sync = self.metronome_sync();
        sync.bpm = crate::timing::clamp_bpm(bpm);
        let applied = sync.bpm;
        self.publish(SyncMessage::MetronomeSync(sync))?;
        Ok(applied)
    }

    pub fn increment_bpm(&mut self, delta: i64) -> Result<u32> {
        let current = self.shared.beat_state().bpm as i64;
        self.set_bpm(current + delta)
    }

    pub fn set_time_signature(&mut self, time_signature: TimeSignature) -> Result<()> {
        self.ensure_host("change the time signature")?;
        let mut sync = self.metronome_sync();
        sync.time_signature_beats = time_signature.beats;
        sync.time_signature_value = time_signature.note_value.as_u32();
        self.publish(SyncMessage::MetronomeSync(sync))
    }

    /// Register a tap now. Returns the tempo once two taps are buffered.
    pub fn tap_tempo(&mut self) -> Result<Option<u32>> {
        self.tap_tempo_at(Instant::now())
    }

    pub fn tap_tempo_at(&mut self, now: Instant) -> Result<Option<u32>> {
        self.ensure_host("tap the tempo")?;
        match self.tapper.tap(now) {
            Some(bpm) => self.set_bpm(bpm as i64).map(Some),
            None => Ok(None),
        }
    }

    /// Tempo of the current tap run, `None` once it went stale.
    pub fn live_tap_bpm(&self) -> Option<u32> {
        self.tapper.live_bpm(Instant::now())
    }

    /// Broadcast the current tempo, signature and transport.
    pub fn sync_metronome(&mut self) -> Result<()> {
        self.ensure_host("sync the metronome")?;
        let sync = self.metronome_sync();
        self.publish(SyncMessage::MetronomeSync(sync))
    }

    fn metronome_sync(&self) -> MetronomeSync {
        self.shared.with_state_read(|s| {
            MetronomeSync::from_state(&s.session, s.session.is_playing, now_millis())
        })
    }

    /// Select a song from the queue.
    pub fn change_song(
        &mut self,
        song_index: Option<u32>,
        song_id: Option<&str>,
        song_title: Option<&str>,
        song_artist: Option<&str>,
    ) -> Result<()> {
        self.ensure_host("change the song")?;
        self.publish(SyncMessage::SongChange(SongChange {
            song_index,
            song_id: song_id.map(str::to_string),
            song_title: song_title.map(str::to_string),
            song_artist: song_artist.map(str::to_string),
        }))
    }

    /// Move the session to `status`. Requesting the current status is a no-op.
    pub fn update_session_status(&mut self, status: SessionStatus) -> Result<()> {
        self.ensure_host("change the session status")?;
        let current = self.shared.status();
        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: current,
                to: status,
            });
        }
        self.publish(SyncMessage::SessionStatus(StatusChange { status }))
    }

    /// Broadcast the full session state.
    pub fn publish_snapshot(&mut self) -> Result<()> {
        if self.role() != Role::Host {
            return Err(Error::NotHost("publish a snapshot"));
        }
        let state = self.shared.session();
        self.send(SyncMessage::Snapshot(Snapshot { state }))
    }

    /// Apply a host change locally, persist it and broadcast it.
    ///
    /// A broadcast that fails because the channel is down is logged; the
    /// snapshot published on reconnect carries the change to followers.
    fn publish(&mut self, message: SyncMessage) -> Result<()> {
        self.apply_message(&message, Role::Host);
        self.published_seq += 1;

        if let Some(writer) = &self.writer {
            writer.write(self.shared.session());
        }

        let envelope = Envelope::new(self.channel.session_id(), self.me.id.clone(), message)
            .with_seq(self.published_seq);
        match self.channel.broadcast(envelope) {
            Err(Error::Disconnected) => {
                log::warn!("[SYNC] Offline, change will be resent on reconnect");
                self.needs_rejoin = true;
                Ok(())
            }
            other => other,
        }
    }

    fn send(&self, message: SyncMessage) -> Result<()> {
        let envelope = Envelope::new(self.channel.session_id(), self.me.id.clone(), message);
        self.channel.broadcast(envelope)
    }

    fn ensure_host(&self, action: &'static str) -> Result<()> {
        let (ended, role) = self
            .shared
            .with_state_read(|s| (s.session.is_ended(), s.role()));
        if ended {
            return Err(Error::SessionEnded);
        }
        if role != Role::Host {
            return Err(Error::NotHost(action));
        }
        Ok(())
    }

    // === Local preferences (never broadcast) ===

    fn update_local<R>(&self, f: impl FnOnce(&mut crate::beat_state::BeatState) -> R) -> Result<R> {
        self.shared.with_state_write(|s| {
            if s.session.is_ended() {
                return Err(Error::SessionEnded);
            }
            let result = f(&mut s.session.beat_state);
            s.bump_version();
            Ok(result)
        })
    }

    pub fn toggle_accent(&self, index: u32) -> Result<()> {
        self.update_local(|b| b.toggle_accent(index))
    }

    pub fn toggle_silent_beat(&self, index: u32) -> Result<()> {
        self.update_local(|b| b.toggle_silent_beat(index))
    }

    pub fn set_silent_mode(&self, enabled: bool) -> Result<()> {
        self.update_local(|b| b.set_silent_mode(enabled))
    }

    pub fn set_subdivision(&self, subdivision: Subdivision) -> Result<()> {
        self.update_local(|b| b.set_subdivision(subdivision))
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.update_local(|b| b.set_volume(volume))
    }

    // === Accessors ===

    pub fn state(&self) -> &StateManager {
        &self.shared
    }

    pub fn session(&self) -> SessionState {
        self.shared.session()
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    pub fn participant(&self) -> &Participant {
        &self.me
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.metronome.is_running()
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.shared.roster()
    }

    /// Roster updates, starting with the current roster.
    pub fn observe_roster(&mut self) -> Receiver<Vec<PresenceEntry>> {
        self.presence.observe()
    }

    pub fn beat_events(&self) -> Receiver<BeatTick> {
        self.metronome.beat_events()
    }

    /// Release the audio device, then leave the channel.
    pub fn leave(&mut self) {
        self.metronome.stop();
        self.channel.unsubscribe();
        self.shared.with_state_write(|s| s.is_connected = false);
        log::info!("[SYNC] {} left {}", self.me.id, self.channel.session_id());
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("participant", &self.me.id)
            .field("session", &self.channel.session_id())
            .field("metronome", &self.metronome)
            .finish_non_exhaustive()
    }
}
