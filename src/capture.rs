//! Microphone capture backends
//!
//! The recorder drives a [`CaptureBackend`] to obtain a [`CaptureSession`],
//! then polls the session for newly captured PCM on every chunk tick. With
//! the `pulse` feature a PulseAudio implementation is available; everything
//! else (tests, other platforms) plugs in its own backend.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::audio::AudioFormat;
use crate::error::LiveError;

/// Microphone access as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Undetermined,
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Ask for microphone access, prompting the user if the platform does.
    async fn request_permission(&self) -> Permission;

    /// Open the device and start capturing in `format`.
    async fn open(&self, format: AudioFormat) -> Result<Box<dyn CaptureSession>, LiveError>;
}

/// One open capture device.
#[async_trait]
pub trait CaptureSession: Send {
    /// Stop accumulating audio. Already captured audio is kept.
    fn pause(&mut self) -> Result<(), LiveError>;

    fn resume(&mut self) -> Result<(), LiveError>;

    /// PCM captured since the previous call.
    fn take_available(&mut self) -> Vec<u8>;

    /// A fault that stopped capture on its own, such as the device going
    /// away. Reported once.
    fn take_failure(&mut self) -> Option<LiveError>;

    /// Stop capturing, write out the complete recording and return its path.
    async fn finish(self: Box<Self>) -> Result<PathBuf, LiveError>;

    /// Stop capturing and drop the device without producing a file.
    fn release(self: Box<Self>);
}

#[cfg(feature = "pulse")]
pub use pulse::PulseMicrophone;

#[cfg(feature = "pulse")]
mod pulse {
    use super::*;

    use chrono::Local;
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tracing::{debug, error, info, warn};

    /// Blocking read size on the capture thread.
    const READ_PERIOD: Duration = Duration::from_millis(20);

    /// Default PulseAudio source, recorded to WAV files under `recordings_dir`.
    pub struct PulseMicrophone {
        app_name: String,
        recordings_dir: PathBuf,
    }

    impl PulseMicrophone {
        pub fn new(app_name: impl Into<String>, recordings_dir: impl Into<PathBuf>) -> Self {
            Self {
                app_name: app_name.into(),
                recordings_dir: recordings_dir.into(),
            }
        }
    }

    #[async_trait]
    impl CaptureBackend for PulseMicrophone {
        async fn request_permission(&self) -> Permission {
            // PulseAudio has no access prompt; failures surface when opening.
            Permission::Granted
        }

        async fn open(&self, format: AudioFormat) -> Result<Box<dyn CaptureSession>, LiveError> {
            fs::create_dir_all(&self.recordings_dir)?;
            let path = self.recordings_dir.join(format!(
                "recording_{}.wav",
                Local::now().format("%Y%m%d_%H%M%S%.3f")
            ));

            let shared = Arc::new(Shared::default());
            let (ready_tx, ready_rx) = oneshot::channel();
            let thread_shared = Arc::clone(&shared);
            let thread_path = path.clone();
            let app_name = self.app_name.clone();

            let thread = std::thread::Builder::new()
                .name("mic-capture".to_string())
                .spawn(move || capture_thread(app_name, format, thread_path, thread_shared, ready_tx))
                .map_err(|e| LiveError::Device(format!("failed to spawn capture thread: {}", e)))?;

            match ready_rx.await {
                Ok(Ok(())) => {
                    info!("Microphone capture started, recording to {:?}", path);
                    Ok(Box::new(PulseSession {
                        shared,
                        thread: Some(thread),
                    }))
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => Err(LiveError::Device(
                    "capture thread exited during setup".to_string(),
                )),
            }
        }
    }

    #[derive(Default)]
    struct Shared {
        pending: Mutex<Vec<u8>>,
        paused: AtomicBool,
        stop: AtomicBool,
        keep_file: AtomicBool,
        failure: Mutex<Option<LiveError>>,
    }

    struct PulseSession {
        shared: Arc<Shared>,
        thread: Option<JoinHandle<Result<PathBuf, LiveError>>>,
    }

    #[async_trait]
    impl CaptureSession for PulseSession {
        fn pause(&mut self) -> Result<(), LiveError> {
            self.shared.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), LiveError> {
            self.shared.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn take_available(&mut self) -> Vec<u8> {
            std::mem::take(&mut *self.shared.pending.lock())
        }

        fn take_failure(&mut self) -> Option<LiveError> {
            self.shared.failure.lock().take()
        }

        async fn finish(mut self: Box<Self>) -> Result<PathBuf, LiveError> {
            self.shared.keep_file.store(true, Ordering::SeqCst);
            self.shared.stop.store(true, Ordering::SeqCst);
            let thread = self
                .thread
                .take()
                .ok_or_else(|| LiveError::Device("capture already finished".to_string()))?;

            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| LiveError::Device(format!("capture join failed: {}", e)))?
                .map_err(|_| LiveError::Device("capture thread panicked".to_string()))?
        }

        fn release(mut self: Box<Self>) {
            self.shared.stop.store(true, Ordering::SeqCst);
            // The thread notices the flag within one read period and cleans up.
            self.thread.take();
        }
    }

    impl Drop for PulseSession {
        fn drop(&mut self) {
            self.shared.stop.store(true, Ordering::SeqCst);
        }
    }

    fn capture_thread(
        app_name: String,
        format: AudioFormat,
        path: PathBuf,
        shared: Arc<Shared>,
        ready: oneshot::Sender<Result<(), LiveError>>,
    ) -> Result<PathBuf, LiveError> {
        let spec = Spec {
            format: Format::S16le,
            channels: format.channel_count as u8,
            rate: format.sample_rate_hz,
        };

        let simple = match Simple::new(
            None,      // default server
            &app_name, // application name
            Direction::Record,
            None,         // default device
            "microphone", // stream description
            &spec,
            None, // default channel map
            None, // default buffering
        ) {
            Ok(simple) => simple,
            Err(e) => {
                error!("Failed to open microphone: {}", e);
                let _ = ready.send(Err(LiveError::Device(ToString::to_string(&e))));
                return Err(LiveError::Device(ToString::to_string(&e)));
            }
        };

        let wav_spec = hound::WavSpec {
            channels: format.channel_count,
            sample_rate: format.sample_rate_hz,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = match hound::WavWriter::create(&path, wav_spec) {
            Ok(writer) => writer,
            Err(e) => {
                let _ = ready.send(Err(LiveError::Resource(e.to_string())));
                return Err(LiveError::Resource(e.to_string()));
            }
        };
        let _ = ready.send(Ok(()));

        let mut buffer = vec![0u8; format.bytes_for(READ_PERIOD)];
        let mut failure = None;
        'capture: while !shared.stop.load(Ordering::SeqCst) {
            if let Err(e) = simple.read(&mut buffer) {
                error!("Microphone read failed: {}", e);
                failure = Some(LiveError::Device(ToString::to_string(&e)));
                break;
            }
            if shared.paused.load(Ordering::SeqCst) {
                continue;
            }

            for sample in buffer.chunks_exact(2) {
                if let Err(e) = writer.write_sample(i16::from_le_bytes([sample[0], sample[1]])) {
                    warn!("Failed to append to recording: {}", e);
                    failure = Some(LiveError::Resource(e.to_string()));
                    break 'capture;
                }
            }
            shared.pending.lock().extend_from_slice(&buffer);
        }

        if let Some(e) = &failure {
            *shared.failure.lock() = Some(e.clone());
        }

        let finalized = writer
            .finalize()
            .map_err(|e| LiveError::Resource(e.to_string()));
        debug!("Microphone capture thread exiting");

        if !shared.keep_file.load(Ordering::SeqCst) {
            discard(&path);
            return Err(failure.unwrap_or_else(|| LiveError::Device("capture released".to_string())));
        }
        match (failure, finalized) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(path),
        }
    }

    fn discard(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove released recording {:?}: {}", path, e);
        }
    }
}
