//! Raw PCM wire format helpers
//!
//! Everything that crosses the socket is 16-bit signed little-endian PCM.
//! Capture devices may hand us other sample types, which are converted here.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::BYTES_PER_SAMPLE;

/// Sample rate and channel layout of an s16le stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes in one frame (one sample per channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// Playback duration of `bytes` of audio in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let rate = self.byte_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((bytes as u64 * 1_000_000) / rate as u64)
    }
}

/// Convert `f32` samples in [-1.0, 1.0] to s16le bytes
pub fn f32_to_s16le(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.put_i16_le(value);
    }
    out.freeze()
}

/// Convert native `i16` samples to s16le bytes
pub fn i16_to_s16le(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.put_i16_le(sample);
    }
    out.freeze()
}

/// Convert offset-binary `u16` samples to s16le bytes
pub fn u16_to_s16le(samples: &[u16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.put_i16_le((sample as i32 - 32768) as i16);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_math() {
        let mono = PcmFormat::new(44_100, 1);
        assert_eq!(mono.bytes_per_frame(), 2);
        assert_eq!(mono.byte_rate(), 88_200);
        assert_eq!(mono.duration_of(88_200), Duration::from_secs(1));

        let stereo = PcmFormat::new(44_100, 2);
        assert_eq!(stereo.byte_rate(), 176_400);
        assert_eq!(stereo.duration_of(17_640), Duration::from_millis(100));
    }

    #[test]
    fn test_f32_conversion_clamps() {
        let bytes = f32_to_s16le(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![0, 32767, -32767, 32767, -32768]);
    }

    #[test]
    fn test_integer_conversions_are_little_endian() {
        assert_eq!(&i16_to_s16le(&[0x0102, -1])[..], &[0x02, 0x01, 0xff, 0xff]);
        assert_eq!(&u16_to_s16le(&[32768, 0, 65535])[..], &[0, 0, 0x00, 0x80, 0xff, 0x7f]);
    }
}
