//! Lookahead click scheduler.
//!
//! The scheduler collects every note that is due within a lookahead window
//! of the audio device clock and returns it for output. Note times advance
//! by pure arithmetic from the tempo in effect when each note is scheduled,
//! so polling jitter never accumulates into drift.

use crate::beat_state::BeatState;
use crate::events::{BeatTick, ClickEvent, ClickRole};
use crate::timing::seconds_per_note;

/// Upper bound on notes scheduled in one pass (guards against a stalled clock).
const MAX_NOTES_PER_PASS: usize = 1024;

/// Output of one scheduling pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchedulePass {
    /// Clicks to hand to the audio output, in time order.
    pub clicks: Vec<ClickEvent>,
    /// Main beats reached during this pass, in time order.
    pub beats: Vec<BeatTick>,
}

impl SchedulePass {
    pub fn is_empty(&self) -> bool {
        self.clicks.is_empty() && self.beats.is_empty()
    }
}

/// Beat/subdivision counters plus the time of the next unscheduled note.
#[derive(Clone, Debug)]
pub struct ClickScheduler {
    /// Beat index within the bar of the next note.
    current_beat: u32,
    /// Subdivision index within the beat of the next note.
    current_subdivision: u32,
    /// Device time in seconds of the next note.
    next_note_time: f64,
    /// Main beats scheduled since the last reset.
    beats_elapsed: u64,
    /// Notes (audible or silent) scheduled since the last reset.
    notes_scheduled: u64,
}

impl Default for ClickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClickScheduler {
    /// Create a scheduler positioned at beat 0, subdivision 0, time 0.
    pub fn new() -> Self {
        Self {
            current_beat: 0,
            current_subdivision: 0,
            next_note_time: 0.0,
            beats_elapsed: 0,
            notes_scheduled: 0,
        }
    }

    /// Reset the counters and place the first note at `start_time`.
    ///
    /// Call this on start with "device now + safety offset".
    pub fn reset_at(&mut self, start_time: f64) {
        self.current_beat = 0;
        self.current_subdivision = 0;
        self.next_note_time = start_time;
        self.beats_elapsed = 0;
        self.notes_scheduled = 0;
    }

    /// Reset the counters to beat 0 at time 0.
    pub fn reset(&mut self) {
        self.reset_at(0.0);
    }

    /// Collect every note due before `now + lookahead`.
    ///
    /// `state` is read once per note, so a tempo change applied between
    /// passes affects only notes not scheduled yet.
    pub fn collect_due(&mut self, state: &BeatState, now: f64, lookahead: f64) -> SchedulePass {
        let window_end = now + lookahead;
        let mut pass = SchedulePass::default();

        while self.next_note_time < window_end {
            if pass.clicks.len() + pass.beats.len() >= MAX_NOTES_PER_PASS {
                log::warn!(
                    "[SCHEDULER] note cap reached at t={:.3}s (window end {:.3}s)",
                    self.next_note_time,
                    window_end
                );
                break;
            }
            self.schedule_note(state, now, &mut pass);
            self.advance(state);
        }

        pass
    }

    fn schedule_note(&mut self, state: &BeatState, now: f64, pass: &mut SchedulePass) {
        let beats_per_bar = state.time_signature.beats.max(1);
        let per_beat = state.subdivision.per_beat();

        // A signature or subdivision change can leave the counters past the
        // end of the new bar; wrap onto the next valid position.
        if self.current_subdivision >= per_beat {
            self.current_subdivision = 0;
            self.current_beat += 1;
        }
        if self.current_beat >= beats_per_bar {
            self.current_beat = 0;
        }

        let beat = self.current_beat;
        let accented = state.is_accented(beat);
        let silent = state.is_silenced(beat);
        let is_main = self.current_subdivision == 0;

        if is_main {
            self.beats_elapsed += 1;
            pass.beats.push(BeatTick {
                beat,
                accented,
                silent,
                time: self.next_note_time,
                lead: (self.next_note_time - now).max(0.0),
            });
        }

        if silent {
            log::trace!("[SCHEDULER] beat {} silenced at t={:.4}s", beat, self.next_note_time);
        } else {
            let role = match (is_main, accented) {
                (true, true) => ClickRole::Accent,
                (true, false) => ClickRole::Beat,
                (false, _) => ClickRole::Subdivision,
            };
            pass.clicks.push(ClickEvent {
                time: self.next_note_time,
                role,
                gain: state.volume,
                beat,
                subdivision: self.current_subdivision,
            });
        }

        self.notes_scheduled += 1;
    }

    fn advance(&mut self, state: &BeatState) {
        let per_beat = state.subdivision.per_beat();
        self.next_note_time += seconds_per_note(state.bpm, state.subdivision);
        self.current_subdivision += 1;
        if self.current_subdivision >= per_beat {
            self.current_subdivision = 0;
            self.current_beat = (self.current_beat + 1) % state.time_signature.beats.max(1);
        }
    }

    /// Device time of the next note that has not been scheduled yet.
    pub fn next_note_time(&self) -> f64 {
        self.next_note_time
    }

    /// Beat index of the next note.
    pub fn current_beat(&self) -> u32 {
        self.current_beat
    }

    /// Subdivision index of the next note.
    pub fn current_subdivision(&self) -> u32 {
        self.current_subdivision
    }

    /// Main beats scheduled since the last reset, silenced or not.
    pub fn beats_elapsed(&self) -> u64 {
        self.beats_elapsed
    }

    /// Notes scheduled since the last reset, silenced or not.
    pub fn notes_scheduled(&self) -> u64 {
        self.notes_scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{NoteValue, Subdivision, TimeSignature};

    fn state(bpm: i64, subdivision: Subdivision) -> BeatState {
        let mut state = BeatState::default();
        state.set_bpm(bpm);
        state.set_subdivision(subdivision);
        state
    }

    #[test]
    fn test_scheduler_reset() {
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(1.25);
        assert_eq!(scheduler.current_beat(), 0);
        assert_eq!(scheduler.current_subdivision(), 0);
        assert_eq!(scheduler.next_note_time(), 1.25);
        assert_eq!(scheduler.beats_elapsed(), 0);
    }

    #[test]
    fn test_only_notes_inside_window_are_scheduled() {
        let state = state(120, Subdivision::None);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.05);

        let pass = scheduler.collect_due(&state, 0.0, 0.1);
        assert_eq!(pass.clicks.len(), 1);
        assert_eq!(pass.clicks[0].role, ClickRole::Accent);

        // Nothing new until the window reaches the next beat at 0.55s.
        assert!(scheduler.collect_due(&state, 0.025, 0.1).is_empty());
        assert!(scheduler.collect_due(&state, 0.40, 0.1).is_empty());
        let pass = scheduler.collect_due(&state, 0.46, 0.1);
        assert_eq!(pass.clicks.len(), 1);
        assert!((pass.clicks[0].time - 0.55).abs() < 1e-12);
        assert_eq!(pass.clicks[0].role, ClickRole::Beat);
        // The tick says how long before it sounds.
        assert!((pass.beats[0].lead - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_notes_are_exactly_spaced() {
        for (bpm, subdivision) in [
            (120, Subdivision::None),
            (90, Subdivision::Eighth),
            (73, Subdivision::Triplet),
            (300, Subdivision::Sixteenth),
        ] {
            let state = state(bpm, subdivision);
            let delta = 60.0 / bpm as f64 / subdivision.per_beat() as f64;
            let mut scheduler = ClickScheduler::new();
            scheduler.reset_at(0.0);

            let pass = scheduler.collect_due(&state, 0.0, 10.0);
            assert!(pass.clicks.len() > 2);
            for pair in pass.clicks.windows(2) {
                assert!((pair[1].time - pair[0].time - delta).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_no_cumulative_drift_with_jittery_polling() {
        let state = state(137, Subdivision::Sixteenth);
        let delta = 60.0 / 137.0 / 4.0;
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.05);

        // Irregular poll times, as produced by a jittery cooperative thread.
        let mut clicks = Vec::new();
        let mut now = 0.0;
        let jitter = [0.025, 0.031, 0.019, 0.044, 0.025, 0.027];
        let mut i = 0;
        while clicks.len() < 5000 {
            clicks.extend(scheduler.collect_due(&state, now, 0.1).clicks);
            now += jitter[i % jitter.len()];
            i += 1;
        }

        for (n, click) in clicks.iter().enumerate() {
            let expected = 0.05 + n as f64 * delta;
            assert!(
                (click.time - expected).abs() < 1e-9,
                "note {n} drifted: {} vs {}",
                click.time,
                expected
            );
        }
    }

    #[test]
    fn test_tempo_change_applies_to_unscheduled_notes_only() {
        let mut state = state(120, Subdivision::None);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.0);

        let first = scheduler.collect_due(&state, 0.0, 0.6);
        assert_eq!(first.clicks.len(), 2);
        assert!((first.clicks[1].time - 0.5).abs() < 1e-12);

        // Next note was already computed with 120 bpm spacing: 1.0s.
        state.set_bpm(60);
        let second = scheduler.collect_due(&state, 0.5, 1.6);
        let times: Vec<f64> = second.clicks.iter().map(|c| c.time).collect();
        assert_eq!(times.len(), 2);
        assert!((times[0] - 1.0).abs() < 1e-12);
        assert!((times[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_roles_and_beat_ticks() {
        let mut state = state(120, Subdivision::Eighth);
        state.set_time_signature(TimeSignature::new(3, NoteValue::Quarter));
        state.toggle_accent(2);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.0);

        // Two bars: 3 beats x 2 clicks x 2 bars.
        let pass = scheduler.collect_due(&state, 0.0, 2.99);
        let roles: Vec<ClickRole> = pass.clicks.iter().map(|c| c.role).collect();
        let (a, b, s) = (ClickRole::Accent, ClickRole::Beat, ClickRole::Subdivision);
        assert_eq!(roles, vec![a, s, b, s, a, s, a, s, b, s, a, s]);

        let ticks: Vec<(u32, bool)> = pass.beats.iter().map(|t| (t.beat, t.accented)).collect();
        assert_eq!(
            ticks,
            vec![(0, true), (1, false), (2, true), (0, true), (1, false), (2, true)]
        );
        assert_eq!(scheduler.beats_elapsed(), 6);
    }

    #[test]
    fn test_silent_beats_produce_no_audio_but_still_count() {
        let mut state = state(120, Subdivision::Eighth);
        state.toggle_silent_beat(1);
        state.toggle_silent_beat(3);
        state.set_silent_mode(true);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.0);

        // 40 main beats = 10 bars of 4/4.
        let mut pass = SchedulePass::default();
        while scheduler.beats_elapsed() < 40 {
            let p = scheduler.collect_due(&state, scheduler.next_note_time(), 0.01);
            pass.clicks.extend(p.clicks);
            pass.beats.extend(p.beats);
        }

        assert_eq!(scheduler.beats_elapsed(), 40);
        assert_eq!(pass.beats.len(), 40);
        assert!(pass.clicks.iter().all(|c| c.beat != 1 && c.beat != 3));
        // Beats 0 and 2 keep both their main click and subdivision.
        assert_eq!(pass.clicks.len(), 40);
        assert_eq!(pass.beats.iter().filter(|t| t.silent).count(), 20);

        // Silent mode off restores audio for those beats.
        state.set_silent_mode(false);
        let p = scheduler.collect_due(&state, scheduler.next_note_time(), 2.0);
        assert!(p.clicks.iter().any(|c| c.beat == 1));
    }

    #[test]
    fn test_signature_shrink_wraps_counters() {
        let mut state = state(120, Subdivision::None);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.0);
        // Schedule beats 0, 1, 2, 3 -> next beat index wraps to 0; schedule 0..2.
        scheduler.collect_due(&state, 0.0, 1.9);
        assert_eq!(scheduler.current_beat(), 0);
        scheduler.collect_due(&state, 0.0, 2.9);
        assert_eq!(scheduler.current_beat(), 2);

        state.set_time_signature(TimeSignature::new(2, NoteValue::Quarter));
        let pass = scheduler.collect_due(&state, 2.9, 0.5);
        assert_eq!(pass.beats.len(), 1);
        assert_eq!(pass.beats[0].beat, 0);
        assert!(pass.beats[0].accented);
    }

    #[test]
    fn test_volume_flows_into_gain() {
        let mut state = state(120, Subdivision::None);
        state.set_volume(0.25);
        let mut scheduler = ClickScheduler::new();
        scheduler.reset_at(0.0);
        let pass = scheduler.collect_due(&state, 0.0, 0.1);
        assert_eq!(pass.clicks[0].gain, 0.25);
    }
}
