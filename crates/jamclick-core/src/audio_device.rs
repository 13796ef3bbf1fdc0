//! Audio device enumeration, configuration and the cpal click output.
//!
//! [`AudioConfig`] is always available so configuration files parse on every
//! build. Device discovery and [`CpalBackend`] need the `native` feature.

use serde::{Deserialize, Serialize};

/// Output device selection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name (None = default)
    pub output_device: Option<String>,
    /// Sample rate (None = use device default)
    pub sample_rate: Option<u32>,
}

impl AudioConfig {
    /// Create a new AudioConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output device.
    pub fn with_output_device(mut self, device: Option<String>) -> Self {
        self.output_device = device;
        self
    }

    /// Set the sample rate.
    pub fn with_sample_rate(mut self, rate: Option<u32>) -> Self {
        self.sample_rate = rate;
        self
    }
}

#[cfg(feature = "native")]
pub use native::*;

#[cfg(feature = "native")]
mod native {
    use super::AudioConfig;
    use crate::click::{ClickConfig, ClickMixer};
    use crate::events::ClickEvent;
    use crate::output::{ClickBackend, ClickOutput};
    use crate::{Error, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample};
    use crossbeam_channel::{Receiver, Sender};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const COMMON_SAMPLE_RATES: [u32; 5] = [44100, 48000, 88200, 96000, 192000];

    /// Information about an output device.
    #[derive(Clone, Debug)]
    pub struct AudioDeviceInfo {
        /// Device name (as reported by the system)
        pub name: String,
        /// Maximum supported output channels
        pub max_output_channels: u32,
        /// Supported sample rates (sorted)
        pub sample_rates: Vec<u32>,
        /// Whether this is the default output device
        pub is_default_output: bool,
    }

    /// List all output devices, default first, then by name.
    pub fn list_audio_devices() -> Result<Vec<AudioDeviceInfo>> {
        let host = cpal::default_host();
        let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        let all_devices = host
            .output_devices()
            .map_err(|e| Error::AudioDevice(e.to_string()))?;

        for device in all_devices {
            let name = match device.name() {
                Ok(n) => n,
                Err(_) => continue,
            };

            let Ok(configs) = device.supported_output_configs() else {
                continue;
            };

            let mut max_output_channels = 0u32;
            let mut sample_rates: Vec<u32> = Vec::new();
            for config in configs {
                max_output_channels = max_output_channels.max(config.channels() as u32);
                let min = config.min_sample_rate();
                let max = config.max_sample_rate();
                for rate in COMMON_SAMPLE_RATES {
                    if rate >= min && rate <= max && !sample_rates.contains(&rate) {
                        sample_rates.push(rate);
                    }
                }
            }
            if max_output_channels == 0 {
                continue;
            }
            sample_rates.sort();

            let is_default_output = default_output_name
                .as_ref()
                .is_some_and(|default| default == &name);

            devices.push(AudioDeviceInfo {
                name,
                max_output_channels,
                sample_rates,
                is_default_output,
            });
        }

        devices.sort_by(|a, b| {
            b.is_default_output
                .cmp(&a.is_default_output)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(devices)
    }

    /// Name of the default output device, if any.
    pub fn default_output_device_name() -> Option<String> {
        cpal::default_host()
            .default_output_device()
            .and_then(|d| d.name().ok())
    }

    /// Print a formatted list of output devices to stdout.
    pub fn print_audio_devices() -> Result<()> {
        let devices = list_audio_devices()?;

        println!("Available Output Devices:");
        println!("=========================\n");

        if devices.is_empty() {
            println!("  No audio output devices found.");
            return Ok(());
        }

        for device in devices {
            let marker = if device.is_default_output { " [default]" } else { "" };
            println!("  {}{}", device.name, marker);
            println!("    Output channels: {}", device.max_output_channels);
            if !device.sample_rates.is_empty() {
                let rates: Vec<String> = device.sample_rates.iter().map(|r| r.to_string()).collect();
                println!("    Sample rates:    {}", rates.join(", "));
            }
            println!();
        }

        Ok(())
    }

    fn find_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
        match name {
            Some(search) => {
                let search_lower = search.to_lowercase();
                let devices = host
                    .output_devices()
                    .map_err(|e| Error::AudioDevice(e.to_string()))?;
                for device in devices {
                    if let Ok(dev_name) = device.name() {
                        if dev_name.to_lowercase().contains(&search_lower) {
                            return Ok(device);
                        }
                    }
                }
                Err(Error::AudioDevice(format!("no output device matching '{}'", search)))
            }
            None => host.default_output_device().ok_or(Error::NoOutputDevice),
        }
    }

    /// Click output on a cpal device.
    ///
    /// The device clock is the number of frames the audio callback has
    /// rendered, so scheduled clicks land on exact sample positions.
    #[derive(Clone, Debug, Default)]
    pub struct CpalBackend {
        audio: AudioConfig,
        click: ClickConfig,
    }

    impl CpalBackend {
        pub fn new(audio: AudioConfig, click: ClickConfig) -> Self {
            Self { audio, click }
        }
    }

    impl ClickBackend for CpalBackend {
        fn name(&self) -> &'static str {
            "cpal"
        }

        fn open(&self) -> Result<Box<dyn ClickOutput>> {
            let host = cpal::default_host();
            let device = find_output_device(&host, self.audio.output_device.as_deref())?;
            let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

            let supported = device
                .default_output_config()
                .map_err(|e| Error::AudioDevice(e.to_string()))?;
            let sample_format = supported.sample_format();
            let mut config: cpal::StreamConfig = supported.config();
            if let Some(rate) = self.audio.sample_rate {
                config.sample_rate = rate;
            }
            let sample_rate = config.sample_rate;

            let frames = Arc::new(AtomicU64::new(0));
            let (click_tx, click_rx) = crossbeam_channel::unbounded();
            let mixer = ClickMixer::new(&self.click, sample_rate);

            let stream = match sample_format {
                SampleFormat::F32 => {
                    build_stream::<f32>(&device, &config, mixer, click_rx, Arc::clone(&frames))?
                }
                SampleFormat::I16 => {
                    build_stream::<i16>(&device, &config, mixer, click_rx, Arc::clone(&frames))?
                }
                SampleFormat::U16 => {
                    build_stream::<u16>(&device, &config, mixer, click_rx, Arc::clone(&frames))?
                }
                other => {
                    return Err(Error::Stream(format!("unsupported sample format {other:?}")));
                }
            };
            stream.play().map_err(|e| Error::Stream(e.to_string()))?;

            log::info!(
                "[AUDIO] Output '{}' started: {} Hz, {} channel(s), {:?}",
                device_name,
                sample_rate,
                config.channels,
                sample_format
            );

            Ok(Box::new(CpalOutput {
                _stream: stream,
                frames,
                sample_rate,
                clicks: click_tx,
            }))
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut mixer: ClickMixer,
        clicks: Receiver<ClickEvent>,
        frames: Arc<AtomicU64>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels.max(1) as usize;
        let mut mono: Vec<f32> = Vec::with_capacity(4096);

        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    while let Ok(click) = clicks.try_recv() {
                        mixer.push(click);
                    }

                    let n_frames = data.len() / channels;
                    mono.clear();
                    mono.resize(n_frames, 0.0);
                    let first_frame = frames.load(Ordering::Acquire);
                    mixer.render(&mut mono, first_frame);

                    for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                        let value = T::from_sample(sample.clamp(-1.0, 1.0));
                        for out in frame.iter_mut() {
                            *out = value;
                        }
                    }
                    frames.fetch_add(n_frames as u64, Ordering::Release);
                },
                |err| log::error!("[AUDIO] Stream error: {}", err),
                None,
            )
            .map_err(|e| Error::Stream(e.to_string()))
    }

    struct CpalOutput {
        _stream: cpal::Stream,
        frames: Arc<AtomicU64>,
        sample_rate: u32,
        clicks: Sender<ClickEvent>,
    }

    impl ClickOutput for CpalOutput {
        fn now(&self) -> f64 {
            self.frames.load(Ordering::Acquire) as f64 / self.sample_rate.max(1) as f64
        }

        fn schedule(&mut self, click: ClickEvent) -> Result<()> {
            self.clicks
                .send(click)
                .map_err(|_| Error::Stream("audio callback has stopped".to_string()))
        }

        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            log::info!("[AUDIO] Output stream closed");
        }
    }
}
