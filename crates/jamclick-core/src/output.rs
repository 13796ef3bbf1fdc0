//! Click output seam.
//!
//! The metronome worker never talks to an audio API directly. It opens a
//! [`ClickOutput`] through a [`ClickBackend`] from inside its own thread
//! (audio streams are frequently not `Send`), reads the device clock from
//! it and hands it the clicks of each scheduling pass.

use crate::events::ClickEvent;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// An open audio output with its own clock.
pub trait ClickOutput {
    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Queue a click to start at `click.time` on the device clock.
    fn schedule(&mut self, click: ClickEvent) -> Result<()>;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;
}

/// Factory for click outputs.
pub trait ClickBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Open the output. Called on the scheduling worker thread.
    fn open(&self) -> Result<Box<dyn ClickOutput>>;
}

/// Headless backend whose clock is a monotonic [`Instant`].
///
/// Clicks are counted and logged at trace level. Used by the relay server,
/// the demo and tests.
#[derive(Clone, Debug, Default)]
pub struct NullBackend {
    opens: Arc<AtomicU64>,
    clicks: Arc<AtomicU64>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many outputs have been opened through this backend.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// How many clicks have been scheduled on any output of this backend.
    pub fn clicks(&self) -> u64 {
        self.clicks.load(Ordering::SeqCst)
    }
}

impl ClickBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&self) -> Result<Box<dyn ClickOutput>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NullOutput {
            epoch: Instant::now(),
            clicks: Arc::clone(&self.clicks),
        }))
    }
}

struct NullOutput {
    epoch: Instant,
    clicks: Arc<AtomicU64>,
}

impl ClickOutput for NullOutput {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, click: ClickEvent) -> Result<()> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        log::trace!(
            "[NULL] {:?} beat {}.{} at {:.4}s (gain {:.2})",
            click.role,
            click.beat,
            click.subdivision,
            click.time,
            click.gain
        );
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        48_000
    }
}
