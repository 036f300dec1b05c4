//! Audio chunk model shared by capture, streaming and playback
//!
//! All audio in the pipeline is 16-bit little-endian PCM. Capture runs at
//! 16 kHz mono, which is what the inference service expects; the service
//! answers with 24 kHz mono.

use std::time::Duration;

/// Bytes per sample for 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub channel_count: u16,
}

impl AudioFormat {
    /// Microphone input sent to the service.
    pub const CAPTURE: AudioFormat = AudioFormat {
        sample_rate_hz: 16_000,
        channel_count: 1,
    };

    /// Speech returned by the service.
    pub const PLAYBACK: AudioFormat = AudioFormat {
        sample_rate_hz: 24_000,
        channel_count: 1,
    };

    /// Bytes of PCM per second of audio.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate_hz as usize * self.channel_count as usize * BYTES_PER_SAMPLE
    }

    /// Bytes of PCM covering `duration`, rounded down to whole frames.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frame = self.channel_count as usize * BYTES_PER_SAMPLE;
        let bytes = (self.byte_rate() as u128 * duration.as_millis() / 1000) as usize;
        bytes - bytes % frame.max(1)
    }
}

/// A bounded run of PCM samples plus the metadata needed to play it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub sample_data: Vec<u8>,
    /// Milliseconds on the producer's monotonic clock.
    pub captured_at_ms: u64,
    pub sample_rate_hz: u32,
    pub channel_count: u16,
}

impl AudioChunk {
    pub fn new(sample_data: Vec<u8>, captured_at_ms: u64, format: AudioFormat) -> Self {
        Self {
            sample_data,
            captured_at_ms,
            sample_rate_hz: format.sample_rate_hz,
            channel_count: format.channel_count,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate_hz: self.sample_rate_hz,
            channel_count: self.channel_count,
        }
    }

    /// Playing time of the samples in this chunk.
    pub fn duration(&self) -> Duration {
        let byte_rate = self.format().byte_rate();
        if byte_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sample_data.len() as u64 * 1_000_000 / byte_rate as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.sample_data.is_empty()
    }
}
