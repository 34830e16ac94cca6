//! PCM16 little-endian helpers.
//!
//! Every audio payload on the wire is 16-bit signed little-endian mono PCM.

use bytes::Bytes;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Decode PCM16 LE into floats using `sample / 32768`.
///
/// A trailing odd byte is ignored.
pub fn decode_pcm16(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode floats as PCM16 LE. Values outside [-1, 1] are clamped.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &s in samples {
        let value = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Pack i16 samples into a PCM16 LE frame.
pub fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

/// Number of whole samples in a PCM16 payload.
pub fn sample_count(data: &[u8]) -> usize {
    data.len() / BYTES_PER_SAMPLE
}

/// Playback duration of `samples` at `sample_rate`, in seconds.
pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f64 / sample_rate as f64
}

/// RMS level normalized to [0, 1].
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_zero_samples() {
        let decoded = decode_pcm16(&[0u8; 480]);
        assert_eq!(decoded.len(), 240);
        assert!(decoded.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_decode_scale() {
        let data = samples_to_bytes(&[i16::MIN, 16384, -16384]);
        let decoded = decode_pcm16(&data);
        assert_eq!(decoded, vec![-1.0, 0.5, -0.5]);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        assert_eq!(decode_pcm16(&[0, 0, 7]).len(), 1);
        assert!(decode_pcm16(&[]).is_empty());
    }

    #[test]
    fn test_encode_clamps() {
        let encoded = encode_pcm16(&[2.0, -2.0, 0.0]);
        let samples: Vec<i16> = encoded
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![32767, -32767, 0]);
    }

    #[test]
    fn test_duration() {
        assert_eq!(duration_secs(2400, 24000), 0.1);
        assert_eq!(duration_secs(100, 0), 0.0);
        assert_eq!(sample_count(&[0u8; 9]), 4);
    }

    #[test]
    fn test_rms_level() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0; 16]), 0.0);
        let full = rms_level(&[i16::MIN; 8]);
        assert!((full - 1.0).abs() < 1e-6);
        let half = rms_level(&[16384, -16384]);
        assert!((half - 0.5).abs() < 1e-6);
    }
}
