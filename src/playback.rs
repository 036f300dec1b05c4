//! Audio output devices
//!
//! The streamer hands each synthesized WAV file to an [`AudioSink`] and gets
//! back an [`ActiveSound`]: a control handle for the sound in flight plus a
//! receiver that resolves when it has finished playing.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::oneshot;

use crate::error::LiveError;

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 1.0;
pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 2.0;

pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return MAX_VOLUME;
    }
    volume.clamp(MIN_VOLUME, MAX_VOLUME)
}

pub fn clamp_rate(rate: f32) -> f32 {
    if rate.is_nan() {
        return 1.0;
    }
    rate.clamp(MIN_RATE, MAX_RATE)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSettings {
    pub volume: f32,
    pub rate: f32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            rate: 1.0,
        }
    }
}

/// Control over one sound that is currently playing.
pub trait SoundControl: Send {
    fn pause(&mut self) -> Result<(), LiveError>;
    fn resume(&mut self) -> Result<(), LiveError>;
    fn set_volume(&mut self, volume: f32) -> Result<(), LiveError>;
    /// Sinks that cannot change speed mid-sound apply it from the next one.
    fn set_rate(&mut self, rate: f32) -> Result<(), LiveError>;
    /// Halt immediately and release the output. Never fails.
    fn stop(&mut self);
}

pub struct ActiveSound {
    pub control: Box<dyn SoundControl>,
    /// Resolves once the sound played to the end (or failed while playing).
    pub finished: oneshot::Receiver<Result<(), LiveError>>,
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Start playing the WAV file at `path`.
    async fn play(&self, path: &Path, settings: PlaybackSettings) -> Result<ActiveSound, LiveError>;
}

#[cfg(feature = "pulse")]
pub use pulse::PulseSink;

#[cfg(feature = "pulse")]
mod pulse {
    use super::*;

    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{debug, error};

    /// Samples written to the server per iteration of the playback thread.
    const WRITE_FRAMES: usize = 480;

    /// Default PulseAudio output.
    pub struct PulseSink {
        app_name: String,
    }

    impl PulseSink {
        pub fn new(app_name: impl Into<String>) -> Self {
            Self {
                app_name: app_name.into(),
            }
        }
    }

    struct Shared {
        paused: AtomicBool,
        stop: AtomicBool,
        volume_bits: AtomicU32,
    }

    struct PulseControl {
        shared: Arc<Shared>,
    }

    impl SoundControl for PulseControl {
        fn pause(&mut self) -> Result<(), LiveError> {
            self.shared.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), LiveError> {
            self.shared.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn set_volume(&mut self, volume: f32) -> Result<(), LiveError> {
            self.shared
                .volume_bits
                .store(clamp_volume(volume).to_bits(), Ordering::SeqCst);
            Ok(())
        }

        fn set_rate(&mut self, _rate: f32) -> Result<(), LiveError> {
            // The stream's sample rate is fixed once opened.
            Ok(())
        }

        fn stop(&mut self) {
            self.shared.stop.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioSink for PulseSink {
        async fn play(
            &self,
            path: &Path,
            settings: PlaybackSettings,
        ) -> Result<ActiveSound, LiveError> {
            let path = path.to_path_buf();
            let (spec, samples) = tokio::task::spawn_blocking(move || {
                let mut reader =
                    hound::WavReader::open(&path).map_err(|e| LiveError::Resource(e.to_string()))?;
                let spec = reader.spec();
                let samples = reader
                    .samples::<i16>()
                    .collect::<Result<Vec<i16>, _>>()
                    .map_err(|e| LiveError::Resource(e.to_string()))?;
                Ok::<_, LiveError>((spec, samples))
            })
            .await
            .map_err(|e| LiveError::Device(ToString::to_string(&e)))??;

            let pulse_spec = Spec {
                format: Format::S16le,
                channels: spec.channels as u8,
                rate: (spec.sample_rate as f32 * clamp_rate(settings.rate)).round() as u32,
            };
            if !pulse_spec.is_valid() {
                return Err(LiveError::Device(format!(
                    "unsupported output format {:?}",
                    spec
                )));
            }

            let shared = Arc::new(Shared {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                volume_bits: AtomicU32::new(clamp_volume(settings.volume).to_bits()),
            });
            let (done_tx, finished) = oneshot::channel();
            let thread_shared = Arc::clone(&shared);
            let app_name = self.app_name.clone();
            let channels = spec.channels as usize;

            std::thread::Builder::new()
                .name("playback".to_string())
                .spawn(move || {
                    let result = play_samples(&app_name, &pulse_spec, &samples, channels, &thread_shared);
                    let _ = done_tx.send(result);
                })
                .map_err(|e| LiveError::Device(format!("failed to spawn playback thread: {}", e)))?;

            Ok(ActiveSound {
                control: Box::new(PulseControl { shared }),
                finished,
            })
        }
    }

    fn play_samples(
        app_name: &str,
        spec: &Spec,
        samples: &[i16],
        channels: usize,
        shared: &Shared,
    ) -> Result<(), LiveError> {
        let simple = Simple::new(
            None,     // default server
            app_name, // application name
            Direction::Playback,
            None,       // default device
            "response", // stream description
            spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| {
            error!("Failed to open audio output: {}", e);
            LiveError::Device(ToString::to_string(&e))
        })?;

        let mut bytes = Vec::with_capacity(WRITE_FRAMES * channels.max(1) * 2);
        for block in samples.chunks(WRITE_FRAMES * channels.max(1)) {
            while shared.paused.load(Ordering::SeqCst) && !shared.stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            if shared.stop.load(Ordering::SeqCst) {
                debug!("Playback stopped mid-sound");
                return Ok(());
            }

            let volume = f32::from_bits(shared.volume_bits.load(Ordering::SeqCst));
            bytes.clear();
            for sample in block {
                let scaled = (*sample as f32 * volume).round() as i16;
                bytes.extend_from_slice(&scaled.to_le_bytes());
            }
            simple
                .write(&bytes)
                .map_err(|e| LiveError::Device(ToString::to_string(&e)))?;
        }

        simple.drain().map_err(|e| LiveError::Device(ToString::to_string(&e)))
    }
}
