//! Buffered, ordered playback of streamed response audio
//!
//! Inbound chunks are queued and only start playing once `buffer_threshold`
//! of them have arrived. Playback then runs chunk by chunk until the queue
//! drains: each chunk is wrapped in a WAV header, written to the scratch
//! directory, played to completion and deleted. A chunk that fails at any
//! of those steps is reported and skipped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::audio::AudioChunk;
use crate::error::LiveError;
use crate::events::EventBus;
use crate::playback::{clamp_rate, clamp_volume, AudioSink, PlaybackSettings, SoundControl};
use crate::wav::chunk_to_wav;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Chunks to queue before playback starts.
    pub buffer_threshold: usize,
    /// Where per-chunk WAV files are written. Purged on stop.
    pub scratch_dir: PathBuf,
    pub volume: f32,
    pub rate: f32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 5,
            scratch_dir: std::env::temp_dir().join("kisan_live_audio"),
            volume: 1.0,
            rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    ChunkAdded { sequence: u64, queue_len: usize },
    PlaybackStarted,
    ChunkPlaying { sequence: u64, queue_len: usize },
    PlaybackCompleted,
    PlaybackPaused,
    PlaybackResumed,
    PlaybackStopped,
    QueueCleared,
    Error(LiveError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub is_paused: bool,
    pub queue_len: usize,
    pub volume: f32,
    pub rate: f32,
}

#[derive(Debug)]
struct QueuedChunk {
    sequence: u64,
    chunk: AudioChunk,
}

struct CurrentSound {
    sequence: u64,
    path: PathBuf,
    control: Box<dyn SoundControl>,
}

enum Command {
    Add(AudioChunk),
    Flush,
    Stop(oneshot::Sender<()>),
    Pause(oneshot::Sender<bool>),
    Resume(oneshot::Sender<bool>),
    SetVolume(f32, oneshot::Sender<f32>),
    SetRate(f32, oneshot::Sender<f32>),
    Status(oneshot::Sender<PlaybackStatus>),
    Clear(oneshot::Sender<()>),
    Cleanup(oneshot::Sender<()>),
}

/// Handle onto the playback driver. Clones share one queue and one output.
#[derive(Clone)]
pub struct AudioStreamer {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<PlaybackEvent>,
}

impl AudioStreamer {
    /// Spawn the playback driver. Must be called from within a tokio runtime.
    pub fn new(sink: Arc<dyn AudioSink>, config: StreamerConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let driver = Driver {
            sink,
            settings: PlaybackSettings {
                volume: clamp_volume(config.volume),
                rate: clamp_rate(config.rate),
            },
            config,
            events: events.clone(),
            commands: command_rx,
            queue: VecDeque::new(),
            next_sequence: 0,
            playing: false,
            paused: false,
            current: None,
            finished: None,
        };
        tokio::spawn(driver.run());

        Self { commands, events }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Queue a chunk; starts playback once enough are buffered.
    pub fn add_chunk(&self, chunk: AudioChunk) {
        if self.commands.send(Command::Add(chunk)).is_err() {
            warn!("Playback driver is gone, dropping audio chunk");
        }
    }

    /// Start playing whatever is queued even if below the buffer threshold.
    pub fn flush(&self) {
        let _ = self.commands.send(Command::Flush);
    }

    /// Halt playback, drop the queue and purge scratch files.
    pub async fn stop(&self) {
        self.request(Command::Stop).await;
    }

    /// Pause the sound in flight. Returns `false` when nothing is playing.
    pub async fn pause(&self) -> bool {
        self.request(Command::Pause).await.unwrap_or(false)
    }

    pub async fn resume(&self) -> bool {
        self.request(Command::Resume).await.unwrap_or(false)
    }

    /// Set the volume, clamped to `[0, 1]`. Returns the applied value.
    pub async fn set_volume(&self, volume: f32) -> f32 {
        let clamped = clamp_volume(volume);
        self.request(|tx| Command::SetVolume(clamped, tx))
            .await
            .unwrap_or(clamped)
    }

    /// Set the playback rate, clamped to `[0.5, 2.0]`. Returns the applied value.
    pub async fn set_playback_rate(&self, rate: f32) -> f32 {
        let clamped = clamp_rate(rate);
        self.request(|tx| Command::SetRate(clamped, tx))
            .await
            .unwrap_or(clamped)
    }

    pub async fn status(&self) -> Option<PlaybackStatus> {
        self.request(Command::Status).await
    }

    /// Drop queued chunks without touching the sound in flight.
    pub async fn clear(&self) {
        self.request(Command::Clear).await;
    }

    /// Stop, purge and drop every listener.
    pub async fn cleanup(&self) {
        self.request(Command::Cleanup).await;
        self.events.clear();
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }
}

struct Driver {
    sink: Arc<dyn AudioSink>,
    config: StreamerConfig,
    settings: PlaybackSettings,
    events: EventBus<PlaybackEvent>,
    commands: mpsc::UnboundedReceiver<Command>,

    queue: VecDeque<QueuedChunk>,
    next_sequence: u64,
    playing: bool,
    paused: bool,
    current: Option<CurrentSound>,
    finished: Option<oneshot::Receiver<Result<(), LiveError>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All streamer handles dropped, shutting down");
                        self.halt().await;
                        break;
                    }
                },
                result = sound_finished(&mut self.finished) => {
                    self.finished = None;
                    self.on_sound_finished(result).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(chunk) => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                self.queue.push_back(QueuedChunk { sequence, chunk });
                self.events.emit(PlaybackEvent::ChunkAdded {
                    sequence,
                    queue_len: self.queue.len(),
                });

                if !self.playing && self.queue.len() >= self.config.buffer_threshold {
                    self.start_playback().await;
                }
            }
            Command::Flush => {
                if !self.playing && !self.queue.is_empty() {
                    debug!("Flushing {} buffered chunks", self.queue.len());
                    self.start_playback().await;
                }
            }
            Command::Stop(reply) => {
                self.halt().await;
                self.events.emit(PlaybackEvent::PlaybackStopped);
                let _ = reply.send(());
            }
            Command::Pause(reply) => {
                let paused = self.pause();
                let _ = reply.send(paused);
            }
            Command::Resume(reply) => {
                let resumed = self.resume();
                let _ = reply.send(resumed);
            }
            Command::SetVolume(volume, reply) => {
                self.settings.volume = volume;
                if let Some(current) = self.current.as_mut() {
                    if let Err(e) = current.control.set_volume(volume) {
                        warn!("Failed to change volume of current sound: {}", e);
                    }
                }
                let _ = reply.send(volume);
            }
            Command::SetRate(rate, reply) => {
                self.settings.rate = rate;
                if let Some(current) = self.current.as_mut() {
                    if let Err(e) = current.control.set_rate(rate) {
                        warn!("Failed to change rate of current sound: {}", e);
                    }
                }
                let _ = reply.send(rate);
            }
            Command::Status(reply) => {
                let _ = reply.send(PlaybackStatus {
                    is_playing: self.playing,
                    is_paused: self.paused,
                    queue_len: self.queue.len(),
                    volume: self.settings.volume,
                    rate: self.settings.rate,
                });
            }
            Command::Clear(reply) => {
                debug!("Clearing {} queued chunks", self.queue.len());
                self.queue.clear();
                self.events.emit(PlaybackEvent::QueueCleared);
                let _ = reply.send(());
            }
            Command::Cleanup(reply) => {
                self.halt().await;
                self.events.emit(PlaybackEvent::PlaybackStopped);
                let _ = reply.send(());
            }
        }
    }

    async fn start_playback(&mut self) {
        info!("Starting playback with {} buffered chunks", self.queue.len());
        self.playing = true;
        self.events.emit(PlaybackEvent::PlaybackStarted);
        self.play_next().await;
    }

    /// Start the next playable chunk, skipping any that fail.
    async fn play_next(&mut self) {
        while let Some(QueuedChunk { sequence, chunk }) = self.queue.pop_front() {
            match self.start_chunk(sequence, &chunk).await {
                Ok(()) => {
                    self.events.emit(PlaybackEvent::ChunkPlaying {
                        sequence,
                        queue_len: self.queue.len(),
                    });
                    return;
                }
                Err(e) => {
                    warn!("Skipping audio chunk {}: {}", sequence, e);
                    self.events.emit(PlaybackEvent::Error(e));
                }
            }
        }

        debug!("Playback queue drained");
        self.playing = false;
        self.paused = false;
        self.events.emit(PlaybackEvent::PlaybackCompleted);
    }

    async fn start_chunk(&mut self, sequence: u64, chunk: &AudioChunk) -> Result<(), LiveError> {
        let wav = chunk_to_wav(chunk)?;

        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let path = self.config.scratch_dir.join(format!("chunk_{:06}.wav", sequence));
        tokio::fs::write(&path, &wav).await?;

        let mut active = match self.sink.play(&path, self.settings).await {
            Ok(active) => active,
            Err(e) => {
                remove_scratch(&path).await;
                return Err(e);
            }
        };

        if self.paused {
            if let Err(e) = active.control.pause() {
                warn!("Failed to hold chunk {} while paused: {}", sequence, e);
            }
        }

        self.finished = Some(active.finished);
        self.current = Some(CurrentSound {
            sequence,
            path,
            control: active.control,
        });
        Ok(())
    }

    async fn on_sound_finished(&mut self, result: Result<Result<(), LiveError>, oneshot::error::RecvError>) {
        let Some(current) = self.current.take() else {
            return;
        };
        remove_scratch(&current.path).await;

        match result {
            Ok(Ok(())) => debug!("Chunk {} finished", current.sequence),
            Ok(Err(e)) => {
                error!("Chunk {} failed during playback: {}", current.sequence, e);
                self.events.emit(PlaybackEvent::Error(e));
            }
            Err(_) => {
                error!("Output for chunk {} went away", current.sequence);
                self.events.emit(PlaybackEvent::Error(LiveError::Device(
                    "audio output closed before the chunk finished".to_string(),
                )));
            }
        }

        self.play_next().await;
    }

    fn pause(&mut self) -> bool {
        if !self.playing || self.paused {
            return false;
        }
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        match current.control.pause() {
            Ok(()) => {
                self.paused = true;
                self.events.emit(PlaybackEvent::PlaybackPaused);
                true
            }
            Err(e) => {
                error!("Failed to pause playback: {}", e);
                self.events.emit(PlaybackEvent::Error(e));
                false
            }
        }
    }

    fn resume(&mut self) -> bool {
        if !self.playing || !self.paused {
            return false;
        }
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        match current.control.resume() {
            Ok(()) => {
                self.paused = false;
                self.events.emit(PlaybackEvent::PlaybackResumed);
                true
            }
            Err(e) => {
                error!("Failed to resume playback: {}", e);
                self.events.emit(PlaybackEvent::Error(e));
                false
            }
        }
    }

    /// Stop the sound in flight, drop the queue and purge scratch files.
    async fn halt(&mut self) {
        self.playing = false;
        self.paused = false;
        self.finished = None;
        if !self.queue.is_empty() {
            debug!("Dropping {} queued chunks", self.queue.len());
        }
        self.queue.clear();

        if let Some(mut current) = self.current.take() {
            debug!("Stopping chunk {}", current.sequence);
            current.control.stop();
        }
        purge_scratch_dir(&self.config.scratch_dir).await;
    }
}

async fn sound_finished(
    finished: &mut Option<oneshot::Receiver<Result<(), LiveError>>>,
) -> Result<Result<(), LiveError>, oneshot::error::RecvError> {
    match finished {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove scratch file {:?}: {}", path, e);
    }
}

async fn purge_scratch_dir(dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No scratch directory to purge at {:?}: {}", dir, e);
            return;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => remove_scratch(&entry.path()).await,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to list scratch directory {:?}: {}", dir, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::playback::ActiveSound;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Play { samples: Vec<i16>, volume: f32, rate: f32 },
        Pause,
        Resume,
        Volume(f32),
        Stop,
    }

    #[derive(Default)]
    struct Recorded {
        calls: Vec<SinkCall>,
        finishers: Vec<oneshot::Sender<Result<(), LiveError>>>,
    }

    /// Sink that records what it was asked to play. Each sound finishes
    /// automatically after `sound_length` (paused test clock) unless
    /// `manual` is set, in which case the test completes it.
    #[derive(Clone)]
    struct FakeSink {
        recorded: Arc<Mutex<Recorded>>,
        sound_length: Duration,
        manual: bool,
    }

    impl FakeSink {
        fn timed(sound_length: Duration) -> Self {
            Self {
                recorded: Arc::default(),
                sound_length,
                manual: false,
            }
        }

        fn manual() -> Self {
            Self {
                recorded: Arc::default(),
                sound_length: Duration::ZERO,
                manual: true,
            }
        }

        fn calls(&self) -> Vec<SinkCall> {
            self.recorded.lock().calls.clone()
        }

        fn played(&self) -> Vec<i16> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    SinkCall::Play { samples, .. } => samples.first().copied(),
                    _ => None,
                })
                .collect()
        }

        fn finish_current(&self) {
            let finisher = self.recorded.lock().finishers.pop();
            if let Some(finisher) = finisher {
                let _ = finisher.send(Ok(()));
            }
        }
    }

    struct FakeControl {
        recorded: Arc<Mutex<Recorded>>,
    }

    impl SoundControl for FakeControl {
        fn pause(&mut self) -> Result<(), LiveError> {
            self.recorded.lock().calls.push(SinkCall::Pause);
            Ok(())
        }

        fn resume(&mut self) -> Result<(), LiveError> {
            self.recorded.lock().calls.push(SinkCall::Resume);
            Ok(())
        }

        fn set_volume(&mut self, volume: f32) -> Result<(), LiveError> {
            self.recorded.lock().calls.push(SinkCall::Volume(volume));
            Ok(())
        }

        fn set_rate(&mut self, _rate: f32) -> Result<(), LiveError> {
            Ok(())
        }

        fn stop(&mut self) {
            self.recorded.lock().calls.push(SinkCall::Stop);
        }
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(
            &self,
            path: &Path,
            settings: PlaybackSettings,
        ) -> Result<ActiveSound, LiveError> {
            let mut reader = hound::WavReader::open(path)
                .map_err(|e| LiveError::Resource(e.to_string()))?;
            let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
            self.recorded.lock().calls.push(SinkCall::Play {
                samples,
                volume: settings.volume,
                rate: settings.rate,
            });

            let (tx, finished) = oneshot::channel();
            if self.manual {
                self.recorded.lock().finishers.push(tx);
            } else {
                let length = self.sound_length;
                tokio::spawn(async move {
                    tokio::time::sleep(length).await;
                    let _ = tx.send(Ok(()));
                });
            }
            Ok(ActiveSound {
                control: Box::new(FakeControl {
                    recorded: Arc::clone(&self.recorded),
                }),
                finished,
            })
        }
    }

    /// 100ms of 24 kHz mono audio whose samples all equal `marker`.
    fn chunk(marker: i16) -> AudioChunk {
        let pcm: Vec<u8> = std::iter::repeat(marker.to_le_bytes())
            .take(2400)
            .flatten()
            .collect();
        AudioChunk::new(pcm, 0, AudioFormat::PLAYBACK)
    }

    fn streamer(sink: &FakeSink, dir: &Path) -> AudioStreamer {
        AudioStreamer::new(
            Arc::new(sink.clone()),
            StreamerConfig {
                scratch_dir: dir.to_path_buf(),
                ..StreamerConfig::default()
            },
        )
    }

    async fn wait_for(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>, wanted: PlaybackEvent) {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if event == wanted {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffers_then_plays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::timed(Duration::from_millis(100));
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        for marker in 1..=4 {
            streamer.add_chunk(chunk(marker));
        }
        let status = streamer.status().await.unwrap();
        assert!(!status.is_playing);
        assert_eq!(status.queue_len, 4);
        assert!(sink.played().is_empty());

        let started = tokio::time::Instant::now();
        for marker in 5..=10 {
            streamer.add_chunk(chunk(marker));
        }
        wait_for(&mut events, PlaybackEvent::PlaybackCompleted).await;

        assert_eq!(sink.played(), (1..=10).collect::<Vec<i16>>());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1100));

        // Scratch files are removed as each chunk finishes.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!streamer.status().await.unwrap().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_chunks_play_for_half_a_second() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::timed(Duration::from_millis(100));
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        for marker in 1..=4 {
            streamer.add_chunk(chunk(marker));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(sink.played().is_empty());

        streamer.add_chunk(chunk(5));
        wait_for(&mut events, PlaybackEvent::PlaybackStarted).await;
        let started = tokio::time::Instant::now();
        wait_for(&mut events, PlaybackEvent::PlaybackCompleted).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(550));
        assert_eq!(sink.played(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_chunk_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::timed(Duration::from_millis(100));
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        streamer.add_chunk(chunk(1));
        streamer.add_chunk(chunk(2));
        // Odd byte count cannot be framed as 16-bit samples.
        streamer.add_chunk(AudioChunk::new(vec![0; 3], 0, AudioFormat::PLAYBACK));
        streamer.add_chunk(chunk(4));
        streamer.add_chunk(chunk(5));

        let mut errors = 0;
        loop {
            match events.recv().await.unwrap() {
                PlaybackEvent::Error(LiveError::Resource(_)) => errors += 1,
                PlaybackEvent::Error(other) => panic!("Unexpected error: {:?}", other),
                PlaybackEvent::PlaybackCompleted => break,
                _ => {}
            }
        }
        assert_eq!(errors, 1);
        assert_eq!(sink.played(), vec![1, 2, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_applies_again_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::timed(Duration::from_millis(100));
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        for marker in 1..=5 {
            streamer.add_chunk(chunk(marker));
        }
        wait_for(&mut events, PlaybackEvent::PlaybackCompleted).await;

        streamer.add_chunk(chunk(6));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.played().len(), 5);

        // Flushing plays a short tail without waiting for more chunks.
        streamer.flush();
        wait_for(&mut events, PlaybackEvent::PlaybackCompleted).await;
        assert_eq!(sink.played(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::manual();
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        for marker in 1..=7 {
            streamer.add_chunk(chunk(marker));
        }
        wait_for(&mut events, PlaybackEvent::ChunkPlaying { sequence: 0, queue_len: 4 }).await;
        std::fs::write(dir.path().join("stale.wav"), b"old").unwrap();

        streamer.stop().await;
        assert_eq!(sink.calls().last(), Some(&SinkCall::Stop));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let status = streamer.status().await.unwrap();
        assert!(!status.is_playing);
        assert_eq!(status.queue_len, 0);

        // A late completion for the stopped sound plays nothing more.
        sink.finish_current();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.played(), vec![1]);
        wait_for(&mut events, PlaybackEvent::PlaybackStopped).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::manual();
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        assert!(!streamer.pause().await);

        for marker in 1..=5 {
            streamer.add_chunk(chunk(marker));
        }
        wait_for(&mut events, PlaybackEvent::ChunkPlaying { sequence: 0, queue_len: 4 }).await;

        assert!(streamer.pause().await);
        assert!(!streamer.pause().await);
        assert!(streamer.status().await.unwrap().is_paused);
        assert!(streamer.resume().await);
        assert!(!streamer.resume().await);

        assert_eq!(streamer.set_volume(1.7).await, 1.0);
        assert_eq!(streamer.set_volume(0.25).await, 0.25);
        assert_eq!(streamer.set_playback_rate(0.1).await, 0.5);
        assert_eq!(streamer.set_playback_rate(4.0).await, 2.0);

        let status = streamer.status().await.unwrap();
        assert_eq!(status.volume, 0.25);
        assert_eq!(status.rate, 2.0);
        assert_eq!(status.queue_len, 4);

        sink.finish_current();
        wait_for(&mut events, PlaybackEvent::ChunkPlaying { sequence: 1, queue_len: 3 }).await;

        let calls = sink.calls();
        assert_eq!(calls[1], SinkCall::Pause);
        assert_eq!(calls[2], SinkCall::Resume);
        assert!(calls.contains(&SinkCall::Volume(0.25)));
        match calls.last() {
            Some(SinkCall::Play { volume, rate, .. }) => {
                assert_eq!(*volume, 0.25);
                assert_eq!(*rate, 2.0);
            }
            other => panic!("Expected second chunk to play, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FakeSink::manual();
        let streamer = streamer(&sink, dir.path());
        let mut events = streamer.subscribe();

        for marker in 1..=3 {
            streamer.add_chunk(chunk(marker));
        }
        streamer.clear().await;
        wait_for(&mut events, PlaybackEvent::QueueCleared).await;
        assert_eq!(streamer.status().await.unwrap().queue_len, 0);

        streamer.cleanup().await;
        wait_for(&mut events, PlaybackEvent::PlaybackStopped).await;
        assert_eq!(events.recv().await, None);
    }
}
