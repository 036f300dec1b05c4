//! Live voice conversation over the socket client
//!
//! Microphone chunks go up as `audio_chunk` messages, response audio comes
//! down into the playback streamer, and the exchange is written into a
//! [`Conversation`]: the farmer's turn starts as a placeholder that the
//! final transcription replaces, and each completed assistant turn becomes
//! one message built from the streamed text parts.

use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{AudioChunk, AudioFormat};
use crate::conversation::{Conversation, Message};
use crate::events::EventBus;
use crate::live_client::{ClientEvent, LiveClient};
use crate::protocol::{InboundEvent, Transcript, DEFAULT_IMAGE_PROMPT};
use crate::recorder::{AudioRecorder, RecorderEvent};
use crate::streamer::AudioStreamer;

/// Shown in place of the farmer's words until the transcription arrives.
pub const TRANSCRIBING_PLACEHOLDER: &str = "Processing voice message...";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A message was appended to the conversation or its text was replaced.
    Message(Message),
    /// Connection lifecycle and errors from the socket client.
    Connection(ClientEvent),
}

#[derive(Default)]
struct Turn {
    conversation: Conversation,
    placeholder: Option<Uuid>,
    reply: String,
}

impl Turn {
    fn append(&mut self, message: Message, events: &EventBus<SessionEvent>) {
        match self.conversation.push(message) {
            Ok(message) => events.emit(SessionEvent::Message(message.clone())),
            Err(e) => warn!("Dropping message: {}", e),
        }
    }

    /// Close the assistant's turn with whatever text it streamed.
    fn commit_reply(&mut self, events: &EventBus<SessionEvent>) {
        let reply = std::mem::take(&mut self.reply);
        let reply = reply.trim();
        if reply.is_empty() {
            return;
        }
        self.append(Message::assistant(reply).voice(), events);
    }

    fn record_transcript(&mut self, transcript: Transcript, events: &EventBus<SessionEvent>) {
        if !transcript.is_final {
            debug!("Partial transcript: {}", transcript.text);
            return;
        }

        if let Some(id) = self.placeholder.take() {
            match self.conversation.replace_text(id, transcript.text.as_str()) {
                Ok(()) => {
                    if let Some(message) = self.conversation.get(id) {
                        events.emit(SessionEvent::Message(message.clone()));
                    }
                    return;
                }
                Err(e) => warn!("Could not replace placeholder: {}", e),
            }
        }
        self.append(Message::user(transcript.text).voice(), events);
    }
}

pub struct VoiceSession {
    client: LiveClient,
    recorder: Arc<AudioRecorder>,
    streamer: AudioStreamer,
    turn: Arc<Mutex<Turn>>,
    events: EventBus<SessionEvent>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    /// Wire the three components together. Connecting is left to the caller.
    pub fn start(client: LiveClient, recorder: Arc<AudioRecorder>, streamer: AudioStreamer) -> Self {
        let token = CancellationToken::new();
        let turn = Arc::new(Mutex::new(Turn::default()));
        let events = EventBus::new();

        let uplink = tokio::spawn(pump_microphone(
            recorder.subscribe(),
            client.clone(),
            token.clone(),
        ));
        let downlink = Downlink {
            streamer: streamer.clone(),
            turn: Arc::clone(&turn),
            events: events.clone(),
            epoch: Instant::now(),
        };
        let downlink = tokio::spawn(downlink.run(client.subscribe(), token.clone()));

        Self {
            client,
            recorder,
            streamer,
            turn,
            events,
            token,
            tasks: vec![uplink, downlink],
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn client(&self) -> &LiveClient {
        &self.client
    }

    /// Snapshot of the transcript so far.
    pub fn conversation(&self) -> Conversation {
        self.turn.lock().conversation.clone()
    }

    /// Start streaming the microphone. Returns `false` if recording could
    /// not start (the recorder reports why).
    pub async fn begin_turn(&self) -> bool {
        if !self.recorder.start_recording().await {
            return false;
        }

        let mut turn = self.turn.lock();
        if turn.placeholder.is_none() {
            let message = Message::user(TRANSCRIBING_PLACEHOLDER).voice();
            turn.placeholder = Some(message.id());
            turn.append(message, &self.events);
        }
        true
    }

    /// Stop the microphone; returns the full recording if one was written.
    pub async fn end_turn(&self) -> Option<PathBuf> {
        self.recorder.stop_recording().await
    }

    /// Cut the assistant off: tell the server and silence local playback.
    pub async fn interrupt(&self) {
        info!("Interrupting response");
        self.client.send_interrupt();
        self.streamer.stop().await;
        self.turn.lock().reply.clear();
    }

    pub fn send_text(&self, text: &str) {
        self.client.send_text(text);
        self.turn.lock().append(Message::user(text), &self.events);
    }

    /// Ask the assistant to analyze an image. The result arrives as an
    /// assistant message.
    pub fn send_image(&self, image: &[u8], prompt: Option<&str>) {
        self.client.send_image(image, prompt);
        let prompt = prompt.unwrap_or(DEFAULT_IMAGE_PROMPT);
        self.turn.lock().append(Message::user(prompt), &self.events);
    }

    /// Release the microphone and speaker, close the socket and stop the pumps.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        self.recorder.cleanup();
        self.streamer.cleanup().await;
        self.client.disconnect().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.events.clear();
        debug!("Voice session closed");
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn pump_microphone(
    mut recorder_events: mpsc::UnboundedReceiver<RecorderEvent>,
    client: LiveClient,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = recorder_events.recv() => event,
        };
        match event {
            Some(RecorderEvent::Chunk(chunk)) if !chunk.is_empty() => {
                client.send_audio_chunk(&chunk.sample_data);
            }
            Some(RecorderEvent::Error(e)) if e.is_self_healing() => {
                debug!("Recorder skipped audio: {}", e)
            }
            Some(RecorderEvent::Error(e)) => warn!("Recorder error: {}", e),
            Some(RecorderEvent::Stopped { path }) => debug!("Recording saved to {:?}", path),
            Some(_) => {}
            None => break,
        }
    }
}

struct Downlink {
    streamer: AudioStreamer,
    turn: Arc<Mutex<Turn>>,
    events: EventBus<SessionEvent>,
    epoch: Instant,
}

impl Downlink {
    async fn run(self, mut client_events: mpsc::UnboundedReceiver<ClientEvent>, token: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = client_events.recv() => event,
            };
            match event {
                Some(ClientEvent::Inbound(inbound)) => self.handle(inbound).await,
                Some(other) => self.events.emit(SessionEvent::Connection(other)),
                None => break,
            }
        }
    }

    async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::AudioData(pcm) => {
                let at = self.epoch.elapsed().as_millis() as u64;
                self.streamer
                    .add_chunk(AudioChunk::new(pcm, at, AudioFormat::PLAYBACK));
            }
            InboundEvent::TextData(text) => self.turn.lock().reply.push_str(&text),
            InboundEvent::TurnComplete => {
                self.streamer.flush();
                self.turn.lock().commit_reply(&self.events);
            }
            InboundEvent::Interrupted(reason) => {
                info!("Server interrupted the response: {:?}", reason);
                self.streamer.stop().await;
                self.turn.lock().commit_reply(&self.events);
            }
            InboundEvent::TranscriptionResult(transcript) => {
                self.turn.lock().record_transcript(transcript, &self.events);
            }
            InboundEvent::ImageAnalysisResult(analysis) => {
                let text = match analysis {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                self.turn.lock().append(Message::assistant(text), &self.events);
            }
            InboundEvent::Ready(ready) => info!("Server ready, session {:?}", ready.session_id),
            InboundEvent::Error(e) => warn!("Server error ({:?}): {}", e.error_type, e.message),
            InboundEvent::FunctionCall(call) => debug!("Function call: {}", call),
            InboundEvent::FunctionResponse(response) => debug!("Function response: {}", response),
        }
    }
}
