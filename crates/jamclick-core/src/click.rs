//! Synthetic click pulses and a sample-accurate voice mixer.
//!
//! Clicks are short sine bursts with an exponential decay, pre-rendered
//! once per role at the device sample rate. The [`ClickMixer`] starts each
//! voice on the exact frame its [`ClickEvent`] was scheduled for.

use crate::events::{ClickEvent, ClickRole};
use serde::{Deserialize, Serialize};

/// Maximum simultaneously sounding clicks.
const MAX_VOICES: usize = 32;

/// Pitch, level and length of one click timbre.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClickTone {
    pub frequency_hz: f32,
    pub gain: f32,
    pub duration_ms: f32,
}

impl ClickTone {
    pub fn new(frequency_hz: f32, gain: f32, duration_ms: f32) -> Self {
        Self {
            frequency_hz,
            gain,
            duration_ms,
        }
    }

    /// Render the tone as mono samples.
    pub fn render(&self, sample_rate: u32) -> Vec<f32> {
        let sample_rate = sample_rate.max(1) as f32;
        let len = (sample_rate * self.duration_ms.max(0.0) / 1000.0) as usize;
        // Decay to roughly -60 dB over the click length.
        let decay = 6.9 / (self.duration_ms.max(1.0) / 1000.0);

        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate;
                let envelope = (-t * decay).exp();
                (t * self.frequency_hz * std::f32::consts::TAU).sin() * envelope * self.gain
            })
            .collect()
    }
}

/// Click timbres for the three roles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickConfig {
    pub accent: ClickTone,
    pub beat: ClickTone,
    pub subdivision: ClickTone,
}

impl Default for ClickConfig {
    fn default() -> Self {
        Self {
            accent: ClickTone::new(1500.0, 1.0, 30.0),
            beat: ClickTone::new(1000.0, 0.7, 30.0),
            subdivision: ClickTone::new(800.0, 0.4, 20.0),
        }
    }
}

impl ClickConfig {
    pub fn tone(&self, role: ClickRole) -> &ClickTone {
        match role {
            ClickRole::Accent => &self.accent,
            ClickRole::Beat => &self.beat,
            ClickRole::Subdivision => &self.subdivision,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Voice {
    start_frame: u64,
    role: ClickRole,
    gain: f32,
}

/// Mixes scheduled clicks into output buffers.
///
/// Runs on the audio device thread: rendering never allocates once the
/// mixer has been constructed.
pub struct ClickMixer {
    accent: Vec<f32>,
    beat: Vec<f32>,
    subdivision: Vec<f32>,
    sample_rate: u32,
    voices: Vec<Voice>,
    /// First device frame not yet rendered.
    next_frame: u64,
}

impl ClickMixer {
    /// Pre-render the click sounds at `sample_rate`.
    pub fn new(config: &ClickConfig, sample_rate: u32) -> Self {
        Self {
            accent: config.accent.render(sample_rate),
            beat: config.beat.render(sample_rate),
            subdivision: config.subdivision.render(sample_rate),
            sample_rate,
            voices: Vec::with_capacity(MAX_VOICES),
            next_frame: 0,
        }
    }

    fn sound(&self, role: ClickRole) -> &[f32] {
        match role {
            ClickRole::Accent => &self.accent,
            ClickRole::Beat => &self.beat,
            ClickRole::Subdivision => &self.subdivision,
        }
    }

    /// Queue a click. Events scheduled in the past start on the next
    /// rendered frame and play in full.
    pub fn push(&mut self, event: ClickEvent) {
        if self.voices.len() >= MAX_VOICES {
            // Drop the oldest voice rather than allocating on the audio thread.
            self.voices.remove(0);
        }
        let start_frame = ((event.time.max(0.0) * self.sample_rate as f64).round() as u64)
            .max(self.next_frame);
        self.voices.push(Voice {
            start_frame,
            role: event.role,
            gain: event.gain,
        });
    }

    /// Number of queued or sounding voices.
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Render `frames` mono frames starting at device frame `first_frame`,
    /// adding into `out` (which must hold at least `frames` samples).
    pub fn render(&mut self, out: &mut [f32], first_frame: u64) {
        let frames = out.len() as u64;
        let end_frame = first_frame + frames;
        self.next_frame = end_frame;

        for voice in &self.voices {
            let sound = self.sound(voice.role);
            let sound_end = voice.start_frame + sound.len() as u64;
            if voice.start_frame >= end_frame || sound_end <= first_frame {
                continue;
            }
            let from = voice.start_frame.max(first_frame);
            let to = sound_end.min(end_frame);
            for frame in from..to {
                let sample = sound[(frame - voice.start_frame) as usize] * voice.gain;
                out[(frame - first_frame) as usize] += sample;
            }
        }

        // Retire voices that have finished playing.
        let accent_len = self.accent.len() as u64;
        let beat_len = self.beat.len() as u64;
        let sub_len = self.subdivision.len() as u64;
        self.voices.retain(|voice| {
            let len = match voice.role {
                ClickRole::Accent => accent_len,
                ClickRole::Beat => beat_len,
                ClickRole::Subdivision => sub_len,
            };
            voice.start_frame + len > end_frame
        });
    }
}
