//! Microphone recorder with periodic chunk emission
//!
//! State machine: `Idle -> Recording -> {Paused <-> Recording} -> Stopped`.
//! While recording, a ticker packages whatever the capture session has
//! accumulated into an [`AudioChunk`] every `chunk_interval`.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioChunk, AudioFormat};
use crate::capture::{CaptureBackend, CaptureSession, Permission};
use crate::error::LiveError;
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub format: AudioFormat,
    pub chunk_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::CAPTURE,
            chunk_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopped,
}

/// Snapshot returned by [`AudioRecorder::recording_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub is_recording: bool,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started,
    Chunk(AudioChunk),
    Paused,
    Resumed,
    Stopped { path: PathBuf },
    Error(LiveError),
}

struct RecorderInner {
    state: RecordingState,
    session: Option<Box<dyn CaptureSession>>,
    ticker: Option<CancellationToken>,
    permission_granted: bool,
}

impl RecorderInner {
    /// Cancel the ticker and hand back the session, if any.
    fn detach(&mut self) -> Option<Box<dyn CaptureSession>> {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel();
        }
        self.session.take()
    }
}

pub struct AudioRecorder {
    backend: Arc<dyn CaptureBackend>,
    config: RecorderConfig,
    inner: Arc<Mutex<RecorderInner>>,
    // Serializes the public operations; `inner` is only held briefly.
    op_lock: tokio::sync::Mutex<()>,
    events: EventBus<RecorderEvent>,
    epoch: Instant,
}

impl AudioRecorder {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: RecorderConfig) -> Self {
        Self {
            backend,
            config,
            inner: Arc::new(Mutex::new(RecorderInner {
                state: RecordingState::Idle,
                session: None,
                ticker: None,
                permission_granted: false,
            })),
            op_lock: tokio::sync::Mutex::new(()),
            events: EventBus::new(),
            epoch: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    pub fn recording_status(&self) -> RecordingStatus {
        let state = self.state();
        RecordingStatus {
            state,
            is_recording: state == RecordingState::Recording,
            sample_rate_hz: self.config.format.sample_rate_hz,
            channel_count: self.config.format.channel_count,
        }
    }

    /// Start a new recording. Any earlier session is torn down first.
    ///
    /// Returns `true` if already recording. Failures are reported as
    /// [`RecorderEvent::Error`] and leave the recorder `Idle`.
    pub async fn start_recording(&self) -> bool {
        let _op = self.op_lock.lock().await;

        let stale = {
            let mut inner = self.inner.lock();
            if inner.state == RecordingState::Recording {
                return true;
            }
            inner.detach()
        };
        if let Some(session) = stale {
            debug!("Releasing previous capture session");
            session.release();
        }

        if !self.inner.lock().permission_granted {
            match self.backend.request_permission().await {
                Permission::Granted => self.inner.lock().permission_granted = true,
                other => {
                    warn!("Microphone permission not granted: {:?}", other);
                    return self.fail(LiveError::Permission(
                        "microphone access was not granted".to_string(),
                    ));
                }
            }
        }

        let session = match self.backend.open(self.config.format).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to open capture device: {}", e);
                return self.fail(e);
            }
        };

        let token = CancellationToken::new();
        {
            let mut inner = self.inner.lock();
            inner.session = Some(session);
            inner.ticker = Some(token.clone());
            inner.state = RecordingState::Recording;
        }
        tokio::spawn(run_ticker(
            Arc::clone(&self.inner),
            self.events.clone(),
            token,
            self.config.clone(),
            self.epoch,
        ));

        info!(
            "Recording started ({} Hz, {} ch)",
            self.config.format.sample_rate_hz, self.config.format.channel_count
        );
        self.events.emit(RecorderEvent::Started);
        true
    }

    pub async fn pause_recording(&self) -> bool {
        let _op = self.op_lock.lock().await;
        let result = {
            let mut inner = self.inner.lock();
            if inner.state != RecordingState::Recording {
                return false;
            }
            let result = match inner.session.as_mut() {
                Some(session) => session.pause(),
                None => Err(LiveError::Device("no capture session".to_string())),
            };
            if result.is_ok() {
                inner.state = RecordingState::Paused;
            }
            result
        };

        match result {
            Ok(()) => {
                debug!("Recording paused");
                self.events.emit(RecorderEvent::Paused);
                true
            }
            Err(e) => {
                error!("Failed to pause recording: {}", e);
                self.release_current();
                self.fail(e)
            }
        }
    }

    pub async fn resume_recording(&self) -> bool {
        let _op = self.op_lock.lock().await;
        let result = {
            let mut inner = self.inner.lock();
            if inner.state != RecordingState::Paused {
                return false;
            }
            let result = match inner.session.as_mut() {
                Some(session) => session.resume(),
                None => Err(LiveError::Device("no capture session".to_string())),
            };
            if result.is_ok() {
                inner.state = RecordingState::Recording;
            }
            result
        };

        match result {
            Ok(()) => {
                debug!("Recording resumed");
                self.events.emit(RecorderEvent::Resumed);
                true
            }
            Err(e) => {
                error!("Failed to resume recording: {}", e);
                self.release_current();
                self.fail(e)
            }
        }
    }

    /// Finalize the recording and return the path of the complete asset.
    ///
    /// Audio captured since the last tick is emitted as one final chunk.
    /// Returns `None` when there is nothing to stop or finalizing failed.
    pub async fn stop_recording(&self) -> Option<PathBuf> {
        let _op = self.op_lock.lock().await;

        let session = {
            let mut inner = self.inner.lock();
            match inner.state {
                RecordingState::Idle | RecordingState::Stopped => return None,
                RecordingState::Recording | RecordingState::Paused => {}
            }
            let was_recording = inner.state == RecordingState::Recording;
            let mut session = inner.detach();
            if was_recording {
                if let Some(session) = session.as_mut() {
                    let tail = session.take_available();
                    if !tail.is_empty() {
                        self.events.emit(RecorderEvent::Chunk(AudioChunk::new(
                            tail,
                            self.epoch.elapsed().as_millis() as u64,
                            self.config.format,
                        )));
                    }
                }
            }
            inner.state = RecordingState::Stopped;
            session
        };

        let Some(session) = session else {
            self.events.emit(RecorderEvent::Error(LiveError::Device(
                "no capture session".to_string(),
            )));
            return None;
        };

        match session.finish().await {
            Ok(path) => {
                info!("Recording stopped, saved to {:?}", path);
                self.events.emit(RecorderEvent::Stopped { path: path.clone() });
                Some(path)
            }
            Err(e) => {
                error!("Failed to finalize recording: {}", e);
                self.events.emit(RecorderEvent::Error(e));
                None
            }
        }
    }

    /// Release the device and drop all listeners, whatever the state.
    pub fn cleanup(&self) {
        self.release_current();
        self.events.clear();
    }

    fn release_current(&self) {
        let session = {
            let mut inner = self.inner.lock();
            inner.state = RecordingState::Idle;
            inner.detach()
        };
        if let Some(session) = session {
            session.release();
        }
    }

    fn fail(&self, error: LiveError) -> bool {
        self.inner.lock().state = RecordingState::Idle;
        self.events.emit(RecorderEvent::Error(error));
        false
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        if let Some(session) = self.inner.lock().detach() {
            session.release();
        }
    }
}

async fn run_ticker(
    inner: Arc<Mutex<RecorderInner>>,
    events: EventBus<RecorderEvent>,
    token: CancellationToken,
    config: RecorderConfig,
    epoch: Instant,
) {
    let mut interval = tokio::time::interval_at(
        Instant::now() + config.chunk_interval,
        config.chunk_interval,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                // Emitting under the lock keeps chunks from racing a stop.
                let mut inner = inner.lock();
                if token.is_cancelled() {
                    continue;
                }
                let recording = inner.state == RecordingState::Recording;
                let Some(session) = inner.session.as_mut() else {
                    continue;
                };
                if recording {
                    let pcm = session.take_available();
                    if !pcm.is_empty() {
                        events.emit(RecorderEvent::Chunk(AudioChunk::new(
                            pcm,
                            epoch.elapsed().as_millis() as u64,
                            config.format,
                        )));
                    }
                }

                if let Some(e) = session.take_failure() {
                    error!("Capture failed mid-recording: {}", e);
                    inner.state = RecordingState::Idle;
                    if let Some(session) = inner.detach() {
                        session.release();
                    }
                    events.emit(RecorderEvent::Error(e));
                    break;
                }
            }
        }
    }
    debug!("Chunk ticker stopped");
}
