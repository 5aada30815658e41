//! Wire audio helpers: G.711 µ-law codec and RMS energy.
//!
//! The orchestrator treats telephony audio as opaque bytes everywhere
//! except the barge-in energy detector, which needs linear PCM to compute
//! RMS. Only the coarse µ-law ↔ 16-bit PCM pair is supported.

use std::time::Duration;

/// Decoding bias of the G.711 µ-law transfer function.
const BIAS: i32 = 0x84;

/// Clip level applied before encoding.
const CLIP: i32 = 32_635;

/// Decode a single µ-law byte to a 16-bit PCM sample.
pub fn mulaw_to_pcm16(byte: u8) -> i16 {
    let u = !byte as i32;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = u & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let sample = if sign != 0 { -magnitude } else { magnitude };
    sample as i16
}

/// Encode a 16-bit PCM sample to a µ-law byte.
pub fn pcm16_to_mulaw(sample: i16) -> u8 {
    let mut value = i32::from(sample);
    let sign = if value < 0 {
        value = -value;
        0x80
    } else {
        0x00
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    let mut exponent = 7;
    while exponent > 0 && value & (1 << (exponent + 7)) == 0 {
        exponent -= 1;
    }
    let mantissa = (value >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

/// Decode a µ-law frame to 16-bit PCM samples.
pub fn decode_mulaw(frame: &[u8]) -> Vec<i16> {
    frame.iter().map(|&b| mulaw_to_pcm16(b)).collect()
}

/// Compute normalized RMS energy (0..1) of a µ-law frame.
///
/// The frame is converted to 16-bit PCM for the RMS computation only.
pub fn rms_of_mulaw(frame: &[u8]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame
        .iter()
        .map(|&b| {
            let s = f64::from(mulaw_to_pcm16(b)) / f64::from(i16::MAX);
            s * s
        })
        .sum();
    ((sum_sq / frame.len() as f64) as f32).sqrt()
}

/// Wall-clock duration of an audio payload at the given byte rate.
pub fn duration_of_bytes(len: usize, bytes_per_second: u32) -> Duration {
    if bytes_per_second == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(len as f64 / f64::from(bytes_per_second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_silence_decodes_to_zero() {
        assert_eq!(mulaw_to_pcm16(0xFF), 0);
    }

    #[test]
    fn mulaw_roundtrip_is_close() {
        for &sample in &[0_i16, 100, -100, 1_000, -1_000, 8_000, -8_000, 30_000] {
            let decoded = mulaw_to_pcm16(pcm16_to_mulaw(sample));
            let error = (i32::from(decoded) - i32::from(sample)).abs();
            // µ-law is logarithmic: tolerance grows with magnitude.
            let tolerance = (i32::from(sample).abs() / 16).max(16);
            assert!(
                error <= tolerance,
                "sample {sample} decoded to {decoded} (error {error} > {tolerance})"
            );
        }
    }

    #[test]
    fn encode_clips_extremes() {
        let max = mulaw_to_pcm16(pcm16_to_mulaw(i16::MAX));
        let min = mulaw_to_pcm16(pcm16_to_mulaw(i16::MIN));
        assert!(max > 30_000);
        assert!(min < -30_000);
    }

    #[test]
    fn rms_of_silence_is_zero() {
        let frame = vec![0xFF_u8; 160];
        assert!(rms_of_mulaw(&frame) < 1e-4);
    }

    #[test]
    fn rms_of_loud_frame_is_high() {
        let loud: Vec<u8> = (0..160)
            .map(|i| {
                let sample = if i % 2 == 0 { 16_000_i16 } else { -16_000 };
                pcm16_to_mulaw(sample)
            })
            .collect();
        assert!(rms_of_mulaw(&loud) > 0.4);
    }

    #[test]
    fn rms_of_empty_frame_is_zero() {
        assert_eq!(rms_of_mulaw(&[]), 0.0);
    }

    #[test]
    fn duration_math() {
        let d = duration_of_bytes(8_000, 8_000);
        assert_eq!(d, Duration::from_secs(1));
        assert_eq!(duration_of_bytes(100, 0), Duration::ZERO);
    }
}
