//! Audio codec boundary helpers.
//!
//! Float/int PCM to base64 conversion happens only at the transport edge;
//! everything inside the engine works on raw byte buffers and integer sample
//! counts at a fixed sample rate.

use base64::prelude::*;

/// Default sample rate for telephony-grade PCM buffers (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Convert float32 amplitude samples to 16-bit signed little-endian PCM.
///
/// Samples are clipped to [-1.0, 1.0] before scaling.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clipped = s.clamp(-1.0, 1.0);
        let value = (clipped * 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Encode raw bytes as standard base64 for the wire.
pub fn bytes_to_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decode a base64 wire payload to raw bytes.
pub fn base64_to_bytes(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64_STANDARD.decode(encoded)
}

/// Convert a millisecond offset to a sample index at the given rate.
pub fn ms_to_samples(ms: u64, sample_rate: u32) -> usize {
    (ms as usize * sample_rate as usize) / 1000
}

/// Convert a sample count to the equivalent millisecond duration.
pub fn samples_to_ms(sample_count: usize, sample_rate: u32) -> u64 {
    ((sample_count as u64) * 1000) / sample_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_pcm16_clips() {
        let pcm = float_to_pcm16(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(pcm.len(), 10);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), 0);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), 32767);
        assert_eq!(i16::from_le_bytes([pcm[4], pcm[5]]), -32767);
        // Out-of-range input clips to full scale
        assert_eq!(i16::from_le_bytes([pcm[6], pcm[7]]), 32767);
        assert_eq!(i16::from_le_bytes([pcm[8], pcm[9]]), -32767);
    }

    #[test]
    fn test_base64_round_trip() {
        let data = vec![0u8, 1, 2, 3, 254, 255];
        let encoded = bytes_to_base64(&data);
        assert_eq!(base64_to_bytes(&encoded).unwrap(), data);
    }

    #[test]
    fn test_ms_sample_conversion() {
        assert_eq!(ms_to_samples(100, 16_000), 1600);
        assert_eq!(ms_to_samples(400, 16_000), 6400);
        assert_eq!(samples_to_ms(1600, 16_000), 100);
        assert_eq!(samples_to_ms(24_000, 24_000), 1000);
    }
}
