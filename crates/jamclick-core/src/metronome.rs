//! The metronome worker.
//!
//! A [`Metronome`] owns one scheduling thread while running. The thread
//! opens its click output, then wakes every poll interval, clones the beat
//! state under the read lock and schedules every note due within the
//! lookahead window of the output's device clock.

use crate::events::BeatTick;
use crate::output::{ClickBackend, ClickOutput};
use crate::scheduler::ClickScheduler;
use crate::state::StateManager;
use crate::timing::SchedulerTiming;
use crate::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Beat ticks buffered for UI consumers before new ones are dropped.
const BEAT_QUEUE_LEN: usize = 64;

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Lookahead click metronome driven by a [`StateManager`].
pub struct Metronome {
    shared: StateManager,
    backend: Arc<dyn ClickBackend>,
    timing: SchedulerTiming,
    worker: Option<Worker>,
    beat_tx: Sender<BeatTick>,
    beat_rx: Receiver<BeatTick>,
}

impl Metronome {
    pub fn new(shared: StateManager, backend: Arc<dyn ClickBackend>, timing: SchedulerTiming) -> Self {
        let (beat_tx, beat_rx) = bounded(BEAT_QUEUE_LEN);
        Self {
            shared,
            backend,
            timing,
            worker: None,
            beat_tx,
            beat_rx,
        }
    }

    /// Start clicking from beat 0, `start_offset_ms` after the device's now.
    ///
    /// Blocks until the output is open so a missing or busy device is
    /// reported here. Calling `start` while running is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::debug!("[METRONOME] start ignored, already running");
            return Ok(());
        }
        // Reap a worker that exited on its own.
        self.stop();

        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let backend = Arc::clone(&self.backend);
        let shared = self.shared.clone();
        let timing = self.timing.clone();
        let beat_tx = self.beat_tx.clone();

        let handle = thread::Builder::new()
            .name("jamclick-scheduler".to_string())
            .spawn(move || {
                let output = match backend.open() {
                    Ok(output) => output,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_worker(output, shared, timing, beat_tx, stop_rx);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!(
                    "[METRONOME] Started on '{}' output (lookahead {}ms, interval {}ms)",
                    self.backend.name(),
                    self.timing.lookahead_ms,
                    self.timing.interval_ms
                );
                self.worker = Some(Worker { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                log::warn!("[METRONOME] Failed to open output: {}", e);
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Stream("scheduler thread exited before opening the output".to_string()))
            }
        }
    }

    /// Stop clicking and join the worker. Idempotent.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                log::error!("[METRONOME] Scheduler thread panicked");
            }
            log::info!("[METRONOME] Stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Receiver of main-beat ticks for UI highlighting.
    pub fn beat_events(&self) -> Receiver<BeatTick> {
        self.beat_rx.clone()
    }

    pub fn timing(&self) -> &SchedulerTiming {
        &self.timing
    }
}

impl Drop for Metronome {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Metronome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metronome")
            .field("backend", &self.backend.name())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn run_worker(
    mut output: Box<dyn ClickOutput>,
    shared: StateManager,
    timing: SchedulerTiming,
    beat_tx: Sender<BeatTick>,
    stop_rx: Receiver<()>,
) {
    let lookahead = timing.lookahead_seconds();
    let interval = timing.interval();
    let mut scheduler = ClickScheduler::new();
    scheduler.reset_at(output.now() + timing.start_offset_seconds());

    loop {
        let beat_state = shared.beat_state();
        let pass = scheduler.collect_due(&beat_state, output.now(), lookahead);

        for click in pass.clicks {
            if let Err(e) = output.schedule(click) {
                log::warn!("[METRONOME] Dropped click at {:.3}s: {}", click.time, e);
            }
        }
        for tick in pass.beats {
            log::trace!("[METRONOME] beat {} at {:.3}s", tick.beat, tick.time);
            // UI consumers that fall behind miss ticks; scheduling never waits on them.
            let _ = beat_tx.try_send(tick);
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!(
        "[METRONOME] Worker exiting after {} beats ({} notes)",
        scheduler.beats_elapsed(),
        scheduler.notes_scheduled()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beat_state::BeatState;
    use crate::output::NullBackend;
    use std::time::Duration;

    struct MissingDevice;

    impl ClickBackend for MissingDevice {
        fn name(&self) -> &'static str {
            "missing"
        }

        fn open(&self) -> Result<Box<dyn ClickOutput>> {
            Err(Error::NoOutputDevice)
        }
    }

    fn metronome(backend: Arc<dyn ClickBackend>) -> Metronome {
        let shared = StateManager::standalone(BeatState::default());
        Metronome::new(shared, backend, SchedulerTiming::default())
    }

    #[test]
    fn test_start_emits_downbeat_first() {
        let backend = NullBackend::new();
        let mut metronome = metronome(Arc::new(backend.clone()));
        let beats = metronome.beat_events();

        metronome.start().unwrap();
        assert!(metronome.is_running());

        let tick = beats.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(tick.beat, 0);
        assert!(tick.accented);

        metronome.stop();
        assert!(!metronome.is_running());
        assert!(backend.clicks() >= 1);
    }

    #[test]
    fn test_double_start_opens_output_once() {
        let backend = NullBackend::new();
        let mut metronome = metronome(Arc::new(backend.clone()));
        metronome.start().unwrap();
        metronome.start().unwrap();
        assert_eq!(backend.opens(), 1);
        metronome.stop();
        metronome.stop();
        assert!(!metronome.is_running());
    }

    #[test]
    fn test_restart_resets_to_downbeat() {
        let backend = NullBackend::new();
        let mut metronome = metronome(Arc::new(backend.clone()));
        let beats = metronome.beat_events();

        metronome.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        metronome.stop();
        while beats.try_recv().is_ok() {}

        metronome.start().unwrap();
        let tick = beats.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(tick.beat, 0);
        assert_eq!(backend.opens(), 2);
    }

    #[test]
    fn test_missing_device_fails_start() {
        let mut metronome = metronome(Arc::new(MissingDevice));
        let err = metronome.start().unwrap_err();
        assert!(matches!(err, Error::NoOutputDevice));
        assert!(!metronome.is_running());
    }
}
