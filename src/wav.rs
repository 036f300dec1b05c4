//! Minimal WAV container synthesis for raw PCM chunks

use crate::audio::{AudioChunk, BYTES_PER_SAMPLE};
use crate::error::LiveError;

/// Size of the canonical RIFF/WAVE header written by [`pcm_to_wav`].
pub const WAV_HEADER_LEN: usize = 44;

const BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WavError {
    #[error("chunk contains no samples")]
    Empty,

    #[error("{len} bytes is not a whole number of {frame}-byte frames")]
    Misaligned { len: usize, frame: usize },

    #[error("unsupported format: {sample_rate} Hz, {channels} channels")]
    InvalidFormat { sample_rate: u32, channels: u16 },

    #[error("{0} bytes of PCM do not fit in a WAV file")]
    TooLarge(usize),
}

impl From<WavError> for LiveError {
    fn from(e: WavError) -> Self {
        LiveError::Resource(e.to_string())
    }
}

/// Wrap 16-bit little-endian PCM in a WAV header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, WavError> {
    if sample_rate == 0 || channels == 0 {
        return Err(WavError::InvalidFormat {
            sample_rate,
            channels,
        });
    }
    if pcm.is_empty() {
        return Err(WavError::Empty);
    }
    let frame = channels as usize * BYTES_PER_SAMPLE;
    if pcm.len() % frame != 0 {
        return Err(WavError::Misaligned {
            len: pcm.len(),
            frame,
        });
    }

    let data_size = u32::try_from(pcm.len())
        .ok()
        .filter(|size| size.checked_add(36).is_some())
        .ok_or(WavError::TooLarge(pcm.len()))?;
    let byte_rate = sample_rate
        .checked_mul(frame as u32)
        .ok_or(WavError::InvalidFormat {
            sample_rate,
            channels,
        })?;
    let block_align = channels * BITS_PER_SAMPLE / 8;

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());
    wav.extend_from_slice(pcm);

    Ok(wav)
}

/// Container for one chunk, using the chunk's own format.
pub fn chunk_to_wav(chunk: &AudioChunk) -> Result<Vec<u8>, WavError> {
    pcm_to_wav(&chunk.sample_data, chunk.sample_rate_hz, chunk.channel_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use std::io::Cursor;

    #[test]
    fn test_header_is_readable() {
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

        let wav = pcm_to_wav(&pcm, 24_000, 1).unwrap();
        assert_eq!(wav.len(), WAV_HEADER_LEN + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 24_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(spec.sample_format, hound::SampleFormat::Int);

        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_stereo_byte_rate() {
        let wav = pcm_to_wav(&[0; 8], 16_000, 2).unwrap();
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 64_000);
        assert_eq!(u16::from_le_bytes(wav[32..34].try_into().unwrap()), 4);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(pcm_to_wav(&[], 24_000, 1), Err(WavError::Empty));
        assert_eq!(
            pcm_to_wav(&[1, 2, 3], 24_000, 1),
            Err(WavError::Misaligned { len: 3, frame: 2 })
        );
        assert_eq!(
            pcm_to_wav(&[0, 0], 0, 1),
            Err(WavError::InvalidFormat {
                sample_rate: 0,
                channels: 1,
            })
        );
    }

    #[test]
    fn test_chunk_uses_declared_format() {
        let chunk = AudioChunk::new(vec![0; 320], 0, AudioFormat::CAPTURE);
        let wav = chunk_to_wav(&chunk).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.duration(), 160);
    }
}
