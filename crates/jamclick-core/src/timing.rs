//! Timing primitives for the click scheduler.
//!
//! This module provides the musical timing types shared by the scheduler,
//! the beat state and the wire messages:
//!
//! - [`TimeSignature`] - Beats per bar plus the note value that gets one beat
//! - [`NoteValue`] - The denominator of a time signature (2, 4, 8 or 16)
//! - [`Subdivision`] - How many clicks are played per main beat
//! - [`SchedulerTiming`] - Lookahead window, poll interval and start offset

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Slowest tempo the metronome accepts.
pub const MIN_BPM: u32 = 20;
/// Fastest tempo the metronome accepts.
pub const MAX_BPM: u32 = 300;

/// Clamp a requested tempo into `[MIN_BPM, MAX_BPM]`.
#[inline]
pub fn clamp_bpm(bpm: i64) -> u32 {
    bpm.clamp(MIN_BPM as i64, MAX_BPM as i64) as u32
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Used for presence `online_at` and the `start_time` carried by
/// metronome sync messages.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The note value that receives one beat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum NoteValue {
    Half,
    Quarter,
    Eighth,
    Sixteenth,
}

impl NoteValue {
    /// Numeric denominator (2, 4, 8 or 16).
    pub fn as_u32(self) -> u32 {
        match self {
            NoteValue::Half => 2,
            NoteValue::Quarter => 4,
            NoteValue::Eighth => 8,
            NoteValue::Sixteenth => 16,
        }
    }
}

impl TryFrom<u32> for NoteValue {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(NoteValue::Half),
            4 => Ok(NoteValue::Quarter),
            8 => Ok(NoteValue::Eighth),
            16 => Ok(NoteValue::Sixteenth),
            other => Err(Error::InvalidValue(format!(
                "note value must be 2, 4, 8 or 16 (got {other})"
            ))),
        }
    }
}

impl From<NoteValue> for u32 {
    fn from(value: NoteValue) -> Self {
        value.as_u32()
    }
}

/// Musical time signature.
///
/// `beats` is the number of clicked beats per bar; the metronome clicks
/// once per `beats` entry regardless of the note value, so 6/8 clicks six
/// times per bar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeSignature")]
pub struct TimeSignature {
    pub beats: u32,
    pub note_value: NoteValue,
}

/// Unchecked wire form; deserialized signatures go through `from_parts`.
#[derive(Deserialize)]
struct RawTimeSignature {
    beats: u32,
    note_value: u32,
}

impl TryFrom<RawTimeSignature> for TimeSignature {
    type Error = Error;

    fn try_from(raw: RawTimeSignature) -> Result<Self, Self::Error> {
        Self::from_parts(raw.beats, raw.note_value)
    }
}

impl TimeSignature {
    /// Create a new time signature.
    ///
    /// `beats` is clamped to at least 1 so a bar always has a downbeat.
    pub fn new(beats: u32, note_value: NoteValue) -> Self {
        Self {
            beats: beats.max(1),
            note_value,
        }
    }

    /// Build a signature from the raw wire fields of a sync message.
    pub fn from_parts(beats: u32, note_value: u32) -> crate::Result<Self> {
        if beats == 0 {
            return Err(Error::InvalidValue(
                "time signature needs at least one beat".to_string(),
            ));
        }
        Ok(Self::new(beats, NoteValue::try_from(note_value)?))
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, NoteValue::Quarter)
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.beats, self.note_value.as_u32())
    }
}

impl FromStr for TimeSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (beats, value) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidValue(format!("expected BEATS/VALUE, got '{s}'")))?;
        let beats: u32 = beats
            .trim()
            .parse()
            .map_err(|_| Error::InvalidValue(format!("invalid beat count '{beats}'")))?;
        let value: u32 = value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidValue(format!("invalid note value '{value}'")))?;
        Self::from_parts(beats, value)
    }
}

/// Number of clicks played for each main beat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subdivision {
    #[default]
    None,
    Eighth,
    Triplet,
    Sixteenth,
}

impl Subdivision {
    /// Clicks per main beat, including the main click itself.
    pub fn per_beat(self) -> u32 {
        match self {
            Subdivision::None => 1,
            Subdivision::Eighth => 2,
            Subdivision::Triplet => 3,
            Subdivision::Sixteenth => 4,
        }
    }
}

impl FromStr for Subdivision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "quarter" => Ok(Subdivision::None),
            "eighth" | "8th" => Ok(Subdivision::Eighth),
            "triplet" => Ok(Subdivision::Triplet),
            "sixteenth" | "16th" => Ok(Subdivision::Sixteenth),
            other => Err(Error::InvalidValue(format!("unknown subdivision '{other}'"))),
        }
    }
}

/// Seconds between two consecutive scheduled notes.
#[inline]
pub fn seconds_per_note(bpm: u32, subdivision: Subdivision) -> f64 {
    60.0 / bpm.max(1) as f64 / subdivision.per_beat() as f64
}

/// Lookahead scheduler timing in milliseconds.
///
/// The worker wakes every `interval_ms` and schedules every note due within
/// `lookahead_ms` of the device clock. The lookahead must exceed the poll
/// interval plus worst-case thread jitter or notes will be late.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTiming {
    /// How far ahead of the device clock notes are scheduled.
    pub lookahead_ms: u64,
    /// How often the scheduling worker wakes up.
    pub interval_ms: u64,
    /// Delay between `start()` and the first click.
    pub start_offset_ms: u64,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            lookahead_ms: 100,
            interval_ms: 25,
            start_offset_ms: 50,
        }
    }
}

impl SchedulerTiming {
    /// Lookahead window in seconds.
    pub fn lookahead_seconds(&self) -> f64 {
        self.lookahead_ms as f64 / 1000.0
    }

    /// Start offset in seconds.
    pub fn start_offset_seconds(&self) -> f64 {
        self.start_offset_ms as f64 / 1000.0
    }

    /// Poll interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_bpm() {
        assert_eq!(clamp_bpm(-5), MIN_BPM);
        assert_eq!(clamp_bpm(19), 20);
        assert_eq!(clamp_bpm(120), 120);
        assert_eq!(clamp_bpm(301), 300);
        assert_eq!(clamp_bpm(i64::MAX), MAX_BPM);
    }

    #[test]
    fn test_time_signature_parse() {
        let sig: TimeSignature = "7/8".parse().unwrap();
        assert_eq!(sig.beats, 7);
        assert_eq!(sig.note_value, NoteValue::Eighth);
        assert_eq!(sig.to_string(), "7/8");

        assert!("3/3".parse::<TimeSignature>().is_err());
        assert!("0/4".parse::<TimeSignature>().is_err());
        assert!("four".parse::<TimeSignature>().is_err());
    }

    #[test]
    fn test_note_value_serializes_as_number() {
        let json = serde_json::to_string(&TimeSignature::default()).unwrap();
        assert_eq!(json, r#"{"beats":4,"note_value":4}"#);
        let bad: Result<TimeSignature, _> = serde_json::from_str(r#"{"beats":4,"note_value":5}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_zero_beat_signature_does_not_deserialize() {
        let zero: Result<TimeSignature, _> = serde_json::from_str(r#"{"beats":0,"note_value":4}"#);
        assert!(zero.is_err());

        let config: Result<TimeSignature, _> = toml::from_str("beats = 0\nnote_value = 8");
        assert!(config.is_err());

        let ok: TimeSignature = serde_json::from_str(r#"{"beats":5,"note_value":8}"#).unwrap();
        assert_eq!(ok, TimeSignature::new(5, NoteValue::Eighth));
    }

    #[test]
    fn test_seconds_per_note() {
        assert!((seconds_per_note(120, Subdivision::None) - 0.5).abs() < 1e-12);
        assert!((seconds_per_note(120, Subdivision::Eighth) - 0.25).abs() < 1e-12);
        assert!((seconds_per_note(90, Subdivision::Triplet) - 60.0 / 90.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_scheduler_timing_defaults() {
        let timing = SchedulerTiming::default();
        assert!((timing.lookahead_seconds() - 0.1).abs() < 1e-12);
        assert_eq!(timing.interval(), Duration::from_millis(25));
    }
}
