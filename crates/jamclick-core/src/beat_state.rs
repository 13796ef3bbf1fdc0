//! Metronome configuration shared by every participant.
//!
//! [`BeatState`] is copied by value into every client. Tempo and time
//! signature are replicated from the host; accents, silent beats,
//! subdivision and volume are local listening preferences.

use crate::timing::{clamp_bpm, Subdivision, TimeSignature};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Maximum number of taps kept for tempo detection.
pub const TAP_BUFFER_LEN: usize = 8;

/// Inactivity after which the tap buffer resets.
pub const TAP_RESET_AFTER: Duration = Duration::from_millis(2000);

/// Tempo, signature and click configuration of the metronome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeatState {
    pub bpm: u32,
    pub time_signature: TimeSignature,
    pub subdivision: Subdivision,
    pub volume: f32,
    /// One entry per beat; `true` plays the accented click.
    pub accent_pattern: Vec<bool>,
    pub silent_mode: bool,
    /// Beat indices muted while `silent_mode` is on.
    pub silent_beats: BTreeSet<u32>,
}

impl Default for BeatState {
    fn default() -> Self {
        let time_signature = TimeSignature::default();
        Self {
            bpm: 120,
            time_signature,
            subdivision: Subdivision::None,
            volume: 0.8,
            accent_pattern: default_accents(time_signature.beats),
            silent_mode: false,
            silent_beats: BTreeSet::new(),
        }
    }
}

fn default_accents(beats: u32) -> Vec<bool> {
    (0..beats.max(1)).map(|i| i == 0).collect()
}

impl BeatState {
    /// Set the tempo, clamped to `[MIN_BPM, MAX_BPM]`. Returns the applied value.
    pub fn set_bpm(&mut self, bpm: i64) -> u32 {
        self.bpm = clamp_bpm(bpm);
        self.bpm
    }

    /// Change the tempo by `delta`, clamped to `[MIN_BPM, MAX_BPM]`.
    pub fn increment_bpm(&mut self, delta: i64) -> u32 {
        self.set_bpm(self.bpm as i64 + delta)
    }

    /// Change the time signature.
    ///
    /// Always resets the accent pattern to a single downbeat accent and
    /// clears the silent beats, since their indices refer to the old bar.
    pub fn set_time_signature(&mut self, time_signature: TimeSignature) {
        self.time_signature = time_signature;
        self.accent_pattern = default_accents(time_signature.beats);
        self.silent_beats.clear();
    }

    /// Toggle the accent on beat `index`. No-op if out of range.
    pub fn toggle_accent(&mut self, index: u32) {
        if index >= self.time_signature.beats {
            return;
        }
        if let Some(accent) = self.accent_pattern.get_mut(index as usize) {
            *accent = !*accent;
        }
    }

    /// Toggle whether beat `index` is muted in silent mode. No-op if out of range.
    pub fn toggle_silent_beat(&mut self, index: u32) {
        if index >= self.time_signature.beats {
            return;
        }
        if !self.silent_beats.remove(&index) {
            self.silent_beats.insert(index);
        }
    }

    pub fn set_silent_mode(&mut self, enabled: bool) {
        self.silent_mode = enabled;
    }

    pub fn set_subdivision(&mut self, subdivision: Subdivision) {
        self.subdivision = subdivision;
    }

    /// Set the click volume, clamped to `[0, 1]`.
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    }

    /// Feed one tap into `tapper` and adopt the detected tempo, if any.
    pub fn tap_tempo(&mut self, tapper: &mut TapTempo, now: Instant) -> Option<u32> {
        let bpm = tapper.tap(now)?;
        Some(self.set_bpm(bpm as i64))
    }

    /// Whether beat `index` plays the accented click.
    pub fn is_accented(&self, index: u32) -> bool {
        self.accent_pattern
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Whether beat `index` is currently muted.
    pub fn is_silenced(&self, index: u32) -> bool {
        self.silent_mode && self.silent_beats.contains(&index)
    }
}

/// Rolling tap-tempo detector.
///
/// Keeps up to [`TAP_BUFFER_LEN`] tap instants. Once two taps are buffered
/// the tempo is derived from the mean inter-tap interval. The buffer (and
/// the live tap tempo) resets after [`TAP_RESET_AFTER`] without a tap.
#[derive(Clone, Debug, Default)]
pub struct TapTempo {
    taps: VecDeque<Instant>,
    live_bpm: Option<u32>,
}

impl TapTempo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tap and return the detected tempo once two taps exist.
    pub fn tap(&mut self, now: Instant) -> Option<u32> {
        if self.is_stale(now) {
            self.reset();
        }

        self.taps.push_back(now);
        while self.taps.len() > TAP_BUFFER_LEN {
            self.taps.pop_front();
        }

        let (first, last) = match (self.taps.front(), self.taps.back()) {
            (Some(first), Some(last)) if self.taps.len() >= 2 => (*first, *last),
            _ => return None,
        };

        let intervals = (self.taps.len() - 1) as f64;
        let mean_ms = last.duration_since(first).as_secs_f64() * 1000.0 / intervals;
        if mean_ms <= f64::EPSILON {
            return self.live_bpm;
        }

        let bpm = clamp_bpm((60_000.0 / mean_ms).round() as i64);
        log::debug!("[TAP] {} taps, mean interval {:.1}ms -> {} bpm", self.taps.len(), mean_ms, bpm);
        self.live_bpm = Some(bpm);
        self.live_bpm
    }

    /// The tempo derived from the current tap run, or `None` once stale.
    pub fn live_bpm(&self, now: Instant) -> Option<u32> {
        if self.is_stale(now) {
            None
        } else {
            self.live_bpm
        }
    }

    /// Number of taps currently buffered.
    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    pub fn reset(&mut self) {
        self.taps.clear();
        self.live_bpm = None;
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.taps
            .back()
            .is_some_and(|last| now.saturating_duration_since(*last) > TAP_RESET_AFTER)
    }
}
