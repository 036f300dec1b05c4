//! kisan-live command line
//!
//! `chat` reads questions from stdin and routes them online or over SMS,
//! `voice` runs a live voice session on the default PulseAudio devices, and
//! `image` sends a crop photo for analysis.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kisan_live::config::Config;
use kisan_live::connectivity::ConnectivityMonitor;
use kisan_live::conversation::{Conversation, GREETING};
use kisan_live::live_client::{ClientEvent, LiveClient};
use kisan_live::protocol::InboundEvent;
use kisan_live::router::{CommandLinkOpener, HttpChatChannel, MessageRouter, RouterError};

const USAGE: &str = "usage: kisan-live <chat | voice | image <path> [prompt]>";
const IMAGE_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("chat") => run_chat(&config).await,
        Some("voice") => run_voice(&config).await,
        Some("image") => {
            let path = args.next().context(USAGE)?;
            run_image(&config, &path, args.next()).await
        }
        _ => bail!(USAGE),
    }
}

async fn run_chat(config: &Config) -> Result<()> {
    let channel = HttpChatChannel::new(config.chat_endpoint()?, config.chat_sender_id.clone())?;
    let router = MessageRouter::new(
        Arc::new(channel),
        Arc::new(CommandLinkOpener::default()),
        config.router(),
    );

    let monitor = ConnectivityMonitor::default();
    let probe = monitor.spawn_probe(reqwest::Client::new(), config.probe());

    let mut conversation = Conversation::new();
    println!("{}\n", GREETING);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match router
            .route(&mut conversation, &line, monitor.is_online())
            .await
        {
            Ok(reply) => println!("{}\n", reply.text()),
            Err(RouterError::EmptyMessage) => continue,
            Err(e) => {
                error!("Could not route message: {}", e);
                return Err(e.into());
            }
        }
    }

    probe.stop().await;
    info!("Chat ended after {} messages", conversation.len());
    Ok(())
}

async fn run_image(config: &Config, path: &str, prompt: Option<String>) -> Result<()> {
    let image = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read image {}", path))?;

    let client = LiveClient::new(config.client());
    let mut events = client.subscribe();
    if !client.connect().await {
        bail!("could not connect to {}", config.server_url);
    }
    client.send_image(&image, prompt.as_deref());
    info!("Sent {} ({} bytes) for analysis", path, image.len());

    let outcome = tokio::time::timeout(IMAGE_REPLY_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Inbound(InboundEvent::ImageAnalysisResult(analysis)) => {
                    match analysis {
                        serde_json::Value::String(text) => println!("{}", text),
                        other => println!("{:#}", other),
                    }
                    return Ok(());
                }
                ClientEvent::Inbound(InboundEvent::TextData(text)) => print!("{}", text),
                ClientEvent::Inbound(InboundEvent::TurnComplete) => {
                    println!();
                    return Ok(());
                }
                ClientEvent::Inbound(InboundEvent::Error(e)) => {
                    bail!("server error: {}", e.message)
                }
                ClientEvent::MaxReconnectAttemptsReached => bail!("lost connection to server"),
                ClientEvent::Error(e) if e.is_self_healing() => debug!("{}", e),
                ClientEvent::Error(e) => warn!("{}", e),
                _ => {}
            }
        }
        bail!("client stopped before a reply arrived")
    })
    .await;

    client.disconnect().await;
    outcome.context("timed out waiting for the analysis")?
}

#[cfg(feature = "pulse")]
async fn run_voice(config: &Config) -> Result<()> {
    use kisan_live::capture::PulseMicrophone;
    use kisan_live::playback::PulseSink;
    use kisan_live::recorder::AudioRecorder;
    use kisan_live::streamer::AudioStreamer;
    use kisan_live::voice_session::{SessionEvent, VoiceSession};

    let microphone = PulseMicrophone::new("kisan-live", config.recordings_dir.clone());
    let recorder = Arc::new(AudioRecorder::new(Arc::new(microphone), config.recorder()));
    let streamer = AudioStreamer::new(Arc::new(PulseSink::new("kisan-live")), config.streamer());
    let session = VoiceSession::start(LiveClient::new(config.client()), recorder, streamer);
    let mut events = session.subscribe();

    if !session.client().connect().await {
        warn!("Server not reachable yet, will keep retrying");
    }
    if !session.begin_turn().await {
        session.shutdown().await;
        bail!("could not start the microphone");
    }
    println!("Listening. Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(SessionEvent::Message(message)) => {
                    let who = if message.is_from_user() { "You" } else { "Kisan Mitra" };
                    println!("{}: {}", who, message.text());
                }
                Some(SessionEvent::Connection(ClientEvent::MaxReconnectAttemptsReached)) => {
                    error!("Giving up on the server");
                    break;
                }
                Some(SessionEvent::Connection(event)) => info!("{:?}", event),
                None => break,
            }
        }
    }

    if let Some(path) = session.end_turn().await {
        info!("Recording saved to {}", path.display());
    }
    session.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "pulse"))]
async fn run_voice(_config: &Config) -> Result<()> {
    bail!("voice mode needs audio devices; rebuild with `--features pulse`")
}
