/// Microphone and speaker check
/// Records a few seconds through the recorder pipeline, reports the chunks
/// it produced and plays the saved recording back.
use anyhow::{bail, Result};
use kisan_live::audio::AudioFormat;
use kisan_live::capture::PulseMicrophone;
use kisan_live::playback::{AudioSink, PlaybackSettings, PulseSink};
use kisan_live::recorder::{AudioRecorder, RecorderConfig, RecorderEvent};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(3);
    let recordings_dir = std::env::temp_dir().join("kisan_live_recordings");

    let recorder = AudioRecorder::new(
        Arc::new(PulseMicrophone::new("kisan-mic-check", recordings_dir)),
        RecorderConfig::default(),
    );
    let mut events = recorder.subscribe();

    println!("Recording for {} seconds, speak now!", seconds);
    if !recorder.start_recording().await {
        bail!("could not start recording");
    }
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let Some(path) = recorder.stop_recording().await else {
        bail!("recording was not saved");
    };

    let mut chunks = 0usize;
    let mut bytes = 0usize;
    let mut peak = 0i16;
    while let Ok(event) = events.try_recv() {
        match event {
            RecorderEvent::Chunk(chunk) => {
                chunks += 1;
                bytes += chunk.sample_data.len();
                for pair in chunk.sample_data.chunks_exact(2) {
                    peak = peak.max(i16::from_le_bytes([pair[0], pair[1]]).saturating_abs());
                }
            }
            RecorderEvent::Error(e) => eprintln!("Recorder error: {}", e),
            _ => {}
        }
    }

    let expected = AudioFormat::CAPTURE.bytes_for(Duration::from_secs(seconds));
    println!("{} chunks, {} bytes (expected about {})", chunks, bytes, expected);
    println!("Peak level: {:.1}%", peak as f32 / i16::MAX as f32 * 100.0);
    if peak < 100 {
        println!("That is very quiet, is the right input selected?");
    }

    println!("Playing back {}", path.display());
    let sink = PulseSink::new("kisan-mic-check");
    let sound = sink.play(&path, PlaybackSettings::default()).await?;
    match sound.finished.await {
        Ok(result) => result?,
        Err(_) => bail!("playback thread vanished"),
    }
    recorder.cleanup();
    Ok(())
}
