//! Reconnecting client for the live inference service
//!
//! A [`LiveClient`] is a cheap handle onto a driver task that owns the one
//! connection, the outbound queue and the reconnect timer. Handles talk to
//! the driver over a command channel; inbound frames and connection changes
//! come back out through an [`EventBus`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::error::LiveError;
use crate::events::EventBus;
use crate::protocol::{parse_frame, InboundEvent, OutboundMessage};
use crate::transport::{write_frame, Connector, FrameSink, FrameStream, WsConnector};

/// Close code for an intentional shutdown. Never triggers a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

const DISCONNECT_REASON: &str = "Client initiated disconnect";

/// Configuration for the live client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the inference service.
    pub url: String,
    /// Automatic reconnects allowed before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_reconnect_delay`.
    pub base_reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8081".to_string(),
            max_reconnect_attempts: 5,
            base_reconnect_delay: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a subscriber can observe from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnection gave up. Fires once per exhausted budget.
    MaxReconnectAttemptsReached,
    Inbound(InboundEvent),
    Error(LiveError),
}

enum Command {
    Connect(oneshot::Sender<bool>),
    Send(OutboundMessage),
    Disconnect(oneshot::Sender<()>),
    IsReady(oneshot::Sender<bool>),
    State(oneshot::Sender<ConnectionState>),
}

enum Internal {
    Handshake {
        generation: u64,
        result: Result<(FrameSink, FrameStream), WsError>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        code: u16,
        reason: String,
        error: Option<LiveError>,
    },
}

/// Handle onto the client driver. Clones share the same connection.
///
/// The driver performs a clean disconnect once the last handle is dropped.
#[derive(Clone)]
pub struct LiveClient {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<ClientEvent>,
}

impl LiveClient {
    /// Create a client using the real WebSocket transport.
    ///
    /// Must be called from within a tokio runtime. Nothing connects until
    /// [`LiveClient::connect`] or the first send.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        let driver = Driver {
            config,
            connector,
            events: events.clone(),
            commands: command_rx,
            internal_tx,
            internal_rx,
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            exhausted: false,
            generation: 0,
            sink: None,
            reader: None,
            handshake: None,
            pending_connects: Vec::new(),
            queue: VecDeque::new(),
            backoff: None,
        };
        tokio::spawn(driver.run());

        Self { commands, events }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Open the connection.
    ///
    /// Returns `true` once connected, or straight away if a connection is
    /// already open or being opened. A failed attempt returns `false`, emits
    /// an error event and schedules a reconnect.
    pub async fn connect(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Connect(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Transmit `message` now if connected, otherwise queue it.
    pub fn send(&self, message: OutboundMessage) {
        if self.commands.send(Command::Send(message)).is_err() {
            error!("Live client driver is gone, dropping outbound message");
        }
    }

    pub fn send_audio_chunk(&self, pcm: &[u8]) {
        self.send(OutboundMessage::audio_chunk(pcm));
    }

    pub fn send_image(&self, image: &[u8], prompt: Option<&str>) {
        self.send(OutboundMessage::image(image, prompt));
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send(OutboundMessage::text(text));
    }

    pub fn send_interrupt(&self) {
        self.send(OutboundMessage::interrupt());
    }

    /// Close the connection with code 1000, drop queued messages and cancel
    /// any pending reconnect. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn is_ready(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::IsReady(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::State(tx)).is_err() {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }
}

struct Driver {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    events: EventBus<ClientEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    state: ConnectionState,
    reconnect_attempt: u32,
    exhausted: bool,
    // Bumped for every connection attempt so late events from an older
    // connection are recognised and ignored.
    generation: u64,

    sink: Option<FrameSink>,
    reader: Option<JoinHandle<()>>,
    handshake: Option<JoinHandle<()>>,
    pending_connects: Vec<oneshot::Sender<bool>>,
    queue: VecDeque<OutboundMessage>,
    backoff: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All live client handles dropped, shutting down");
                        self.teardown().await;
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                _ = backoff_elapsed(&mut self.backoff) => {
                    self.backoff = None;
                    info!("Reconnect attempt {}", self.reconnect_attempt);
                    self.start_connect();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                if self.state != ConnectionState::Disconnected {
                    let _ = reply.send(true);
                    return;
                }
                if self.exhausted {
                    info!("Manual connect, resetting reconnect budget");
                    self.exhausted = false;
                    self.reconnect_attempt = 0;
                }
                self.pending_connects.push(reply);
                self.start_connect();
            }
            Command::Send(message) => self.send(message).await,
            Command::Disconnect(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::IsReady(reply) => {
                let _ = reply.send(self.state == ConnectionState::Connected && self.sink.is_some());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Handshake { generation, result } => {
                if generation != self.generation {
                    debug!("Ignoring handshake from stale connection {}", generation);
                    return;
                }
                self.handshake = None;
                match result {
                    Ok((sink, stream)) => self.on_open(sink, stream).await,
                    Err(e) => {
                        error!("Failed to connect to {}: {}", self.config.url, e);
                        self.state = ConnectionState::Disconnected;
                        self.events.emit(ClientEvent::Error(LiveError::from(e)));
                        self.resolve_pending(false);
                        self.schedule_reconnect();
                    }
                }
            }
            Internal::Frame { generation, text } => {
                if generation != self.generation {
                    return;
                }
                match parse_frame(&text) {
                    Ok(Some(event)) => self.events.emit(ClientEvent::Inbound(event)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Dropping malformed frame: {}", e);
                        self.events.emit(ClientEvent::Error(LiveError::from(e)));
                    }
                }
            }
            Internal::Closed {
                generation,
                code,
                reason,
                error,
            } => {
                if generation != self.generation || self.state != ConnectionState::Connected {
                    return;
                }
                if let Some(error) = error {
                    self.events.emit(ClientEvent::Error(error));
                }
                self.on_closed(code, reason);
            }
        }
    }

    fn start_connect(&mut self) {
        self.backoff = None;
        self.state = ConnectionState::Connecting;
        self.generation += 1;

        info!("Connecting to {}", self.config.url);
        let generation = self.generation;
        let handshake = self.connector.connect(&self.config.url);
        let tx = self.internal_tx.clone();
        self.handshake = Some(tokio::spawn(async move {
            let result = handshake.await;
            let _ = tx.send(Internal::Handshake { generation, result });
        }));
    }

    async fn on_open(&mut self, sink: FrameSink, stream: FrameStream) {
        info!("Connected to {}", self.config.url);
        self.state = ConnectionState::Connected;
        self.reconnect_attempt = 0;
        self.exhausted = false;
        self.sink = Some(sink);
        self.reader = Some(tokio::spawn(read_frames(
            stream,
            self.generation,
            self.internal_tx.clone(),
        )));

        self.events.emit(ClientEvent::Connected);
        self.resolve_pending(true);
        self.flush_queue().await;
    }

    async fn flush_queue(&mut self) {
        if !self.queue.is_empty() {
            debug!("Flushing {} queued messages", self.queue.len());
        }
        while self.state == ConnectionState::Connected {
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            self.write(message).await;
        }
    }

    async fn send(&mut self, message: OutboundMessage) {
        if self.state == ConnectionState::Connected {
            self.write(message).await;
            return;
        }

        debug!("Not connected, queueing `{}` message", message.kind());
        self.queue.push_back(message);

        // Connecting now supersedes any pending backoff. An exhausted budget
        // waits for an explicit connect().
        if self.state == ConnectionState::Disconnected && !self.exhausted {
            self.start_connect();
        }
    }

    async fn write(&mut self, message: OutboundMessage) {
        let Some(sink) = self.sink.as_mut() else {
            self.queue.push_front(message);
            return;
        };

        let frame = Message::text(message.to_frame());
        if let Err(e) = write_frame(sink, frame).await {
            error!("Failed to send `{}` message: {}", message.kind(), e);
            self.queue.push_front(message);
            let reason = e.to_string();
            self.events.emit(ClientEvent::Error(LiveError::from(e)));
            self.on_closed(CLOSE_ABNORMAL, reason);
        }
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.state = ConnectionState::Disconnected;

        info!("Connection closed with code {}: {}", code, reason);
        self.events.emit(ClientEvent::Disconnected { code, reason });

        if code != CLOSE_NORMAL {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_attempt < self.config.max_reconnect_attempts {
            self.reconnect_attempt += 1;
            let delay = self.config.base_reconnect_delay * self.reconnect_attempt;
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, self.reconnect_attempt, self.config.max_reconnect_attempts
            );
            self.events.emit(ClientEvent::Reconnecting {
                attempt: self.reconnect_attempt,
                delay,
            });
            self.backoff = Some(Box::pin(tokio::time::sleep(delay)));
        } else if !self.exhausted {
            self.exhausted = true;
            warn!(
                "Giving up after {} reconnect attempts",
                self.config.max_reconnect_attempts
            );
            self.events.emit(ClientEvent::MaxReconnectAttemptsReached);
        }
    }

    fn resolve_pending(&mut self, connected: bool) {
        for reply in self.pending_connects.drain(..) {
            let _ = reply.send(connected);
        }
    }

    /// Intentional shutdown: no reconnect follows.
    async fn teardown(&mut self) {
        let was_active = self.state != ConnectionState::Disconnected || self.backoff.is_some();

        self.backoff = None;
        self.generation += 1;
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.resolve_pending(false);

        if let Some(mut sink) = self.sink.take() {
            let frame = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: DISCONNECT_REASON.into(),
            }));
            if let Err(e) = sink.send(frame).await {
                debug!("Close frame not delivered: {}", e);
            }
            if let Err(e) = sink.close().await {
                debug!("Error closing sink: {}", e);
            }
        }

        if !self.queue.is_empty() {
            debug!("Discarding {} queued messages", self.queue.len());
        }
        self.queue.clear();
        self.state = ConnectionState::Disconnected;
        self.reconnect_attempt = 0;
        self.exhausted = false;

        if was_active {
            info!("Disconnected from {}", self.config.url);
            self.events.emit(ClientEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: DISCONNECT_REASON.to_string(),
            });
        }
    }
}

async fn backoff_elapsed(backoff: &mut Option<Pin<Box<Sleep>>>) {
    match backoff {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn read_frames(
    mut stream: FrameStream,
    generation: u64,
    tx: mpsc::UnboundedSender<Internal>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                let _ = tx.send(Internal::Frame {
                    generation,
                    text: text.as_str().to_string(),
                });
            }
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(Internal::Frame { generation, text });
                }
                Err(_) => debug!("Ignoring non-UTF-8 binary frame of {} bytes", bytes.len()),
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
                let _ = tx.send(Internal::Closed {
                    generation,
                    code,
                    reason,
                    error: None,
                });
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket read error: {}", e);
                let _ = tx.send(Internal::Closed {
                    generation,
                    code: CLOSE_ABNORMAL,
                    reason: e.to_string(),
                    error: Some(LiveError::from(e)),
                });
                return;
            }
        }
    }

    let _ = tx.send(Internal::Closed {
        generation,
        code: CLOSE_ABNORMAL,
        reason: "connection dropped".to_string(),
        error: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    /// Server side of one in-memory connection.
    struct ServerEnd {
        written: mpsc::UnboundedReceiver<Message>,
        inject: mpsc::UnboundedSender<Result<Message, WsError>>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        refuse: Arc<AtomicBool>,
        attempts: Arc<Mutex<Vec<Instant>>>,
        servers: Arc<Mutex<VecDeque<ServerEnd>>>,
    }

    impl FakeConnector {
        fn refusing() -> Self {
            let connector = Self::default();
            connector.refuse.store(true, Ordering::SeqCst);
            connector
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().len()
        }

        fn take_server(&self) -> ServerEnd {
            self.servers.lock().pop_front().expect("no open connection")
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            _url: &str,
        ) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>> {
            self.attempts.lock().push(Instant::now());
            if self.refuse.load(Ordering::SeqCst) {
                return Box::pin(async {
                    Err(WsError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    )))
                });
            }

            let (written_tx, written) = mpsc::unbounded_channel::<Message>();
            let (inject, inject_rx) = mpsc::unbounded_channel::<Result<Message, WsError>>();
            self.servers.lock().push_back(ServerEnd { written, inject });

            let sink = futures_util::sink::unfold(written_tx, |tx, message: Message| async move {
                tx.send(message).map_err(|_| WsError::ConnectionClosed)?;
                Ok::<_, WsError>(tx)
            });
            let stream = futures_util::stream::unfold(inject_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Box::pin(async move { Ok((sink, stream)) })
        }
    }

    fn config(max_reconnect_attempts: u32) -> ClientConfig {
        ClientConfig {
            url: "ws://test.invalid".to_string(),
            max_reconnect_attempts,
            base_reconnect_delay: Duration::from_millis(2000),
        }
    }

    fn text_of(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, f: F) -> ClientEvent
    where
        F: Fn(&ClientEvent) -> bool,
    {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if f(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_backs_off_linearly_then_gives_up() {
        let connector = FakeConnector::refusing();
        let client = LiveClient::with_connector(config(3), Arc::new(connector.clone()));
        let mut events = client.subscribe();

        assert!(!client.connect().await);
        next_matching(&mut events, |e| {
            matches!(e, ClientEvent::MaxReconnectAttemptsReached)
        })
        .await;

        let attempts = connector.attempts.lock().clone();
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|w| w[1].duration_since(w[0]).as_millis())
            .collect();
        for (gap, expected) in gaps.iter().zip([2000u128, 4000, 6000]) {
            assert!(
                *gap >= expected && *gap < expected + 50,
                "gap {} not close to {}",
                gap,
                expected
            );
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempt_count(), 4);
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, ClientEvent::MaxReconnectAttemptsReached);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_messages_flush_in_order() {
        let connector = FakeConnector::refusing();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));

        assert!(!client.connect().await);
        client.send_text("one");
        client.send_text("two");
        client.send_text("three");
        // Each send retried the connection; let those refusals settle.
        tokio::time::sleep(Duration::from_millis(10)).await;

        connector.refuse.store(false, Ordering::SeqCst);
        assert!(client.connect().await);
        assert_eq!(client.state().await, ConnectionState::Connected);

        let mut server = connector.take_server();
        for expected in ["one", "two", "three"] {
            let frame = text_of(server.written.recv().await.unwrap());
            assert_eq!(frame["type"], "text");
            assert_eq!(frame["data"], expected);
        }

        client.send_text("four");
        let frame = text_of(server.written.recv().await.unwrap());
        assert_eq!(frame["data"], "four");
        assert!(server.written.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_disconnect_are_idempotent() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();

        assert!(client.connect().await);
        assert!(client.connect().await);
        assert_eq!(connector.attempt_count(), 1);
        assert!(client.is_ready().await);

        let mut server = connector.take_server();
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_ready().await);

        match server.written.recv().await {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), CLOSE_NORMAL);
                assert_eq!(frame.reason.as_str(), DISCONNECT_REASON);
            }
            other => panic!("Expected close frame, got {:?}", other),
        }

        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: DISCONNECT_REASON.to_string(),
            })
        );
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_does_not_drop_connection() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();
        assert!(client.connect().await);
        let server = connector.take_server();

        server.inject.send(Ok(Message::text("{not json"))).unwrap();
        server
            .inject
            .send(Ok(Message::text(r#"{"type":"mystery"}"#)))
            .unwrap();
        server
            .inject
            .send(Ok(Message::text(r#"{"type":"text","data":"Namaste"}"#)))
            .unwrap();

        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        match events.recv().await {
            Some(ClientEvent::Error(LiveError::Protocol { raw, .. })) => assert_eq!(raw, "{not json"),
            other => panic!("Expected protocol error, got {:?}", other),
        }
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Inbound(InboundEvent::TextData(
                "Namaste".to_string()
            )))
        );
        assert!(client.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_reconnects_after_backoff() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();
        assert!(client.connect().await);

        let server = connector.take_server();
        drop(server);

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await,
            ClientEvent::Disconnected {
                code: CLOSE_ABNORMAL,
                reason: "connection dropped".to_string(),
            }
        );
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(2000),
            })
        );

        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        let attempts = connector.attempts.lock().clone();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].duration_since(attempts[0]) >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_status_is_abnormal() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();
        assert!(client.connect().await);

        let server = connector.take_server();
        server.inject.send(Ok(Message::Close(None))).unwrap();

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await,
            ClientEvent::Disconnected {
                code: CLOSE_NO_STATUS,
                reason: String::new(),
            }
        );
        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Reconnecting { attempt: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_server_close_does_not_reconnect() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();
        assert!(client.connect().await);

        let server = connector.take_server();
        server
            .inject
            .send(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))))
            .unwrap();

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await,
            ClientEvent::Disconnected {
                code: CLOSE_NORMAL,
                reason: "bye".to_string(),
            }
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_backoff() {
        let connector = FakeConnector::refusing();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();

        assert!(!client.connect().await);
        next_matching(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;
        client.send_text("never sent");
        assert_eq!(client.state().await, ConnectionState::Connecting);
        assert_eq!(connector.attempt_count(), 2);
        client.disconnect().await;

        connector.refuse.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempt_count(), 2);

        // The queue was cleared by disconnect.
        assert!(client.connect().await);
        let mut server = connector.take_server();
        tokio::task::yield_now().await;
        assert!(server.written.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_during_backoff_connects_immediately() {
        let connector = FakeConnector::refusing();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();

        assert!(!client.connect().await);
        next_matching(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;

        connector.refuse.store(false, Ordering::SeqCst);
        client.send_text("urgent");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(client.state().await, ConnectionState::Connected);

        let mut server = connector.take_server();
        let frame = text_of(server.written.recv().await.unwrap());
        assert_eq!(frame["data"], "urgent");

        // The superseded backoff never fires.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_waits_for_manual_connect() {
        let connector = FakeConnector::refusing();
        let client = LiveClient::with_connector(config(1), Arc::new(connector.clone()));
        let mut events = client.subscribe();

        assert!(!client.connect().await);
        next_matching(&mut events, |e| {
            matches!(e, ClientEvent::MaxReconnectAttemptsReached)
        })
        .await;
        assert_eq!(connector.attempt_count(), 2);

        client.send_text("held back");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempt_count(), 2);

        connector.refuse.store(false, Ordering::SeqCst);
        assert!(client.connect().await);
        let mut server = connector.take_server();
        let frame = text_of(server.written.recv().await.unwrap());
        assert_eq!(frame["data"], "held back");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_requeued_for_next_connection() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        let mut events = client.subscribe();
        assert!(client.connect().await);

        let first = connector.take_server();
        let ServerEnd { written, inject } = first;
        drop(written);

        client.send_text("survives");
        assert!(matches!(
            next_matching(&mut events, |e| matches!(e, ClientEvent::Error(_))).await,
            ClientEvent::Error(LiveError::Transport(_))
        ));
        next_matching(&mut events, |e| matches!(e, ClientEvent::Connected)).await;
        drop(inject);

        let mut second = connector.take_server();
        let frame = text_of(second.written.recv().await.unwrap());
        assert_eq!(frame["data"], "survives");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_closes_cleanly() {
        let connector = FakeConnector::default();
        let client = LiveClient::with_connector(config(5), Arc::new(connector.clone()));
        assert!(client.connect().await);
        let mut server = connector.take_server();

        drop(client);
        match server.written.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(u16::from(frame.code), CLOSE_NORMAL),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
