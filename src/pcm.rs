//! PCM codec
//!
//! Converts between floating-point samples in [-1.0, 1.0] and 16-bit signed
//! little-endian PCM, plus the base64 framing used on the wire.

use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;

use crate::error::DecodeError;

/// Microphone capture rate expected by the model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of the model's spoken replies.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Decoded audio ready for scheduling. Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Result<Self, DecodeError> {
        if sample_rate == 0 {
            return Err(DecodeError::NoSampleRate);
        }
        if channels == 0 {
            return Err(DecodeError::NoChannels);
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }

    /// Downmix to a single channel by averaging.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.samples.clone();
        }
        let channels = self.channels as usize;
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    Duration::from_nanos(frames * 1_000_000_000 / sample_rate as u64)
}

pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    ((duration.as_nanos() * sample_rate as u128 + 500_000_000) / 1_000_000_000) as u64
}

fn to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Encode float samples as 16-bit little-endian PCM. Out-of-range input is clamped.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Encode float samples straight to the base64 text the model expects.
pub fn encode_base64(samples: &[f32]) -> String {
    general_purpose::STANDARD.encode(encode(samples))
}

/// Decode base64 text to raw bytes.
pub fn decode(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(general_purpose::STANDARD.decode(data)?)
}

/// Interpret little-endian 16-bit PCM bytes as an [`AudioBuffer`].
pub fn bytes_to_audio_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Misaligned {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    AudioBuffer::new(samples, sample_rate, channels)
}

/// Convenience for the inbound path: base64 text to a buffer.
pub fn decode_audio(data: &str, sample_rate: u32, channels: u16) -> Result<AudioBuffer, DecodeError> {
    let bytes = decode(data)?;
    bytes_to_audio_buffer(&bytes, sample_rate, channels)
}

/// Root-mean-square energy of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Pull the rate out of a mime type such as `audio/pcm;rate=24000`.
pub fn parse_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}
