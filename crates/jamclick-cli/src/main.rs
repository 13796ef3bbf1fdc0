//! jamclick CLI - The `jam` command.
//!
//! Runs a local metronome, the session relay server, or an in-process
//! demo of a host and followers sharing one session.
//!
//! # Architecture
//!
//! - **jamclick-core**: Scheduler, metronome, session sync, config
//! - **jamclick-http**: WebSocket relay and REST API

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jamclick_core::{
    BeatState, BeatTick, ClickBackend, Config, CpalBackend, JsonFileStore, LocalHub, Metronome,
    NullBackend, StateManager, Subdivision, TimeSignature,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// jamclick - Collaborative metronome
#[derive(Parser, Debug)]
#[command(name = "jam")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A lookahead metronome with shared jam sessions", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List audio output devices
    Devices,

    /// Play a local click
    Click {
        /// Tempo in beats per minute (clamped to 20..=300)
        #[arg(short, long)]
        bpm: Option<i64>,

        /// Time signature such as 3/4 or 7/8
        #[arg(short, long)]
        signature: Option<TimeSignature>,

        /// none, eighth, triplet or sixteenth
        #[arg(long)]
        subdivision: Option<Subdivision>,

        /// Click volume between 0.0 and 1.0
        #[arg(long)]
        volume: Option<f32>,

        /// Accented beats, zero-based (e.g. 0,2)
        #[arg(long, value_delimiter = ',')]
        accent: Vec<u32>,

        /// Beats muted in silent mode, zero-based
        #[arg(long, value_delimiter = ',')]
        silent: Vec<u32>,

        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(long)]
        seconds: Option<u64>,

        /// Schedule clicks without opening an audio device
        #[arg(long)]
        null_audio: bool,
    },

    /// Run the session relay server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Simulate a host and followers sharing a session
    Demo {
        /// Number of followers
        #[arg(short, long, default_value_t = 2)]
        followers: usize,

        /// Tempo the host sets
        #[arg(short, long, default_value_t = 96)]
        bpm: i64,
    },

    /// Write the default config file
    InitConfig,

    /// Print the config file location
    ConfigPath,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Commands::Devices => {
            jamclick_core::print_audio_devices()?;
            Ok(())
        }
        Commands::Click {
            bpm,
            signature,
            subdivision,
            volume,
            accent,
            silent,
            seconds,
            null_audio,
        } => {
            let config = Config::load_or_default();
            let mut beat_state = config.metronome.to_beat_state();
            apply_click_flags(
                &mut beat_state,
                ClickFlags {
                    bpm,
                    signature,
                    subdivision,
                    volume,
                    accent,
                    silent,
                },
            );
            run_click(&config, beat_state, seconds.map(Duration::from_secs), null_audio)
        }
        Commands::Serve { port } => {
            let config = Config::load_or_default();
            let port = port.unwrap_or(config.session.server_port);
            let data_dir = config.session.data_dir()?;
            let store = JsonFileStore::new(&data_dir)
                .with_context(|| format!("Failed to open session store {}", data_dir.display()))?;
            log::info!("Session records in {}", data_dir.display());

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(jamclick_http::start_server(
                LocalHub::new(),
                Arc::new(store),
                port,
            ))
        }
        Commands::Demo { followers, bpm } => {
            let config = Config::load_or_default();
            demo::run(&config, followers, bpm)
        }
        Commands::InitConfig => {
            let path = Config::create_default_config_file()?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::ConfigPath => {
            println!("{}", Config::config_path()?.display());
            Ok(())
        }
    }
}

/// Command-line overrides for the click; applied after the config file.
#[derive(Debug, Default)]
struct ClickFlags {
    bpm: Option<i64>,
    signature: Option<TimeSignature>,
    subdivision: Option<Subdivision>,
    volume: Option<f32>,
    accent: Vec<u32>,
    silent: Vec<u32>,
}

fn apply_click_flags(state: &mut BeatState, flags: ClickFlags) {
    if let Some(bpm) = flags.bpm {
        state.set_bpm(bpm);
    }
    if let Some(signature) = flags.signature {
        state.set_time_signature(signature);
    }
    if let Some(subdivision) = flags.subdivision {
        state.set_subdivision(subdivision);
    }
    if let Some(volume) = flags.volume {
        state.set_volume(volume);
    }
    if !flags.accent.is_empty() {
        let beats = state.time_signature.beats;
        state.accent_pattern = (0..beats).map(|i| flags.accent.contains(&i)).collect();
    }
    if !flags.silent.is_empty() {
        state.set_silent_mode(true);
        for beat in flags.silent {
            state.toggle_silent_beat(beat);
        }
    }
}

fn run_click(
    config: &Config,
    beat_state: BeatState,
    limit: Option<Duration>,
    null_audio: bool,
) -> Result<()> {
    let backend: Arc<dyn ClickBackend> = if null_audio {
        Arc::new(NullBackend::new())
    } else {
        Arc::new(CpalBackend::new(config.audio.clone(), config.click.clone()))
    };

    log::info!(
        "Clicking at {} BPM in {} ({})",
        beat_state.bpm,
        beat_state.time_signature,
        backend.name()
    );
    let shared = StateManager::standalone(beat_state);
    let mut metronome = Metronome::new(shared, backend, config.scheduler.clone());
    let beats = metronome.beat_events();

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    metronome.start()?;
    log::info!("(Press Ctrl+C to stop)");

    let started = Instant::now();
    let mut pending = VecDeque::new();
    while !term.load(Ordering::Relaxed) {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        let wait = pending
            .front()
            .map(|(due, _): &(Instant, BeatTick)| due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_millis(100))
            .min(Duration::from_millis(100));
        if let Ok(tick) = beats.recv_timeout(wait) {
            pending.push_back((Instant::now() + tick.lead_time(), tick));
        }
        for tick in take_due(&mut pending, Instant::now()) {
            let marker = match (tick.silent, tick.accented) {
                (true, _) => ".",
                (false, true) => "X",
                (false, false) => "x",
            };
            println!("{:>3} {} @ {:.3}s", tick.beat + 1, marker, tick.time);
        }
    }

    metronome.stop();
    log::info!("Stopped");
    Ok(())
}

/// Pop the ticks whose beat has sounded by `now`, in order.
fn take_due(pending: &mut VecDeque<(Instant, BeatTick)>, now: Instant) -> Vec<BeatTick> {
    let mut due = Vec::new();
    while pending.front().is_some_and(|(at, _)| *at <= now) {
        if let Some((_, tick)) = pending.pop_front() {
            due.push(tick);
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_ticks_print_when_they_sound() {
        let tick = |beat, lead| BeatTick {
            beat,
            accented: beat == 0,
            silent: false,
            time: 0.0,
            lead,
        };
        let received = Instant::now();
        let mut pending: VecDeque<_> = [tick(0, 0.05), tick(1, 0.55)]
            .into_iter()
            .map(|t| (received + t.lead_time(), t))
            .collect();

        assert!(take_due(&mut pending, received).is_empty());
        let first = take_due(&mut pending, received + Duration::from_millis(60));
        assert_eq!(first.iter().map(|t| t.beat).collect::<Vec<_>>(), vec![0]);
        let second = take_due(&mut pending, received + Duration::from_secs(1));
        assert_eq!(second.iter().map(|t| t.beat).collect::<Vec<_>>(), vec![1]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_click_flags_override_config() {
        let args = Args::parse_from([
            "jam",
            "click",
            "--bpm",
            "400",
            "--signature",
            "3/4",
            "--accent",
            "0,2",
            "--silent",
            "1",
        ]);
        let Commands::Click {
            bpm,
            signature,
            accent,
            silent,
            ..
        } = args.command
        else {
            panic!("expected click");
        };

        let mut state = BeatState::default();
        apply_click_flags(
            &mut state,
            ClickFlags {
                bpm,
                signature,
                accent,
                silent,
                ..ClickFlags::default()
            },
        );
        assert_eq!(state.bpm, 300);
        assert_eq!(state.time_signature.beats, 3);
        assert_eq!(state.accent_pattern, vec![true, false, true]);
        assert!(state.silent_mode);
        assert!(state.is_silenced(1));
    }
}
