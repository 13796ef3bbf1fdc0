//! Click events produced by the scheduler.
//!
//! - [`ClickRole`] - Which of the three click timbres a note uses
//! - [`ClickEvent`] - One audible click, timed against the device clock
//! - [`BeatTick`] - One main beat, published for UI highlighting

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The timbre of a scheduled click.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClickRole {
    /// Accented main beat (highest pitch and gain).
    Accent,
    /// Plain main beat.
    Beat,
    /// Subdivision click between main beats (quieter, lower pitch).
    Subdivision,
}

impl ClickRole {
    /// Whether this click falls on a main beat.
    pub fn is_main_beat(self) -> bool {
        !matches!(self, ClickRole::Subdivision)
    }
}

/// An audible click scheduled at an absolute device time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClickEvent {
    /// Device-clock time in seconds at which the click starts.
    pub time: f64,
    /// Timbre of the click.
    pub role: ClickRole,
    /// Output gain multiplier (the beat state volume).
    pub gain: f32,
    /// Beat index within the bar.
    pub beat: u32,
    /// Subdivision index within the beat (0 = main beat).
    pub subdivision: u32,
}

/// A main beat, emitted once per beat (never per subdivision).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeatTick {
    /// Beat index within the bar.
    pub beat: u32,
    /// Whether the beat is accented.
    pub accented: bool,
    /// Whether the beat was muted by silent mode.
    pub silent: bool,
    /// Device-clock time in seconds at which the beat sounds.
    pub time: f64,
    /// Seconds between emission and the beat sounding.
    ///
    /// Ticks are published when scheduled, up to a lookahead window early.
    /// Highlighting consumers should wait this long after receipt.
    #[serde(default)]
    pub lead: f64,
}

impl BeatTick {
    /// [`BeatTick::lead`] as a duration.
    pub fn lead_time(&self) -> Duration {
        Duration::from_secs_f64(self.lead.max(0.0))
    }
}
