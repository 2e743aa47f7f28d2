//! # PCM Conversion and Transport Encoding
//!
//! Converts between the floating point samples the audio devices work with and the
//! 16-bit little-endian PCM the remote endpoint speaks, and wraps the bytes in base64
//! for the JSON transport.
//!
//! ## Wire formats:
//! - **Outbound**: mono, 16-bit signed little-endian, 16kHz, mime `audio/pcm;rate=16000`
//! - **Inbound**: mono, 16-bit signed little-endian, 24kHz
//!
//! ## Lossy on purpose:
//! `float_to_pcm16` maps `s` to `round(s * 32768)`. A full-scale positive sample (1.0)
//! would land on 32768, one past `i16::MAX`, so it saturates to 32767. That one-step
//! clip at the very top of the range is accepted as part of the 16-bit compression.

use crate::error::{AppError, AppResult};
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale between the float range [-1.0, 1.0] and the i16 range.
pub const PCM16_SCALE: f32 = 32768.0;

/// Mime type of an outbound frame captured at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert one float sample to 16-bit PCM.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let scaled = (sample * PCM16_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert one 16-bit PCM sample back to float.
pub fn pcm16_to_float(sample: i16) -> f32 {
    sample as f32 / PCM16_SCALE
}

/// Pack float samples as little-endian 16-bit PCM bytes.
pub fn encode_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(float_to_pcm16(sample));
    }
    bytes
}

/// Unpack little-endian 16-bit PCM bytes to float samples.
///
/// ## Errors:
/// An odd byte count cannot hold whole samples and is rejected as `DecodeFailure`.
pub fn decode_pcm16_le(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::DecodeFailure(format!(
            "PCM payload length must be even for 16-bit samples, got {} bytes",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);

    // Read each 16-bit sample (little-endian format)
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(pcm16_to_float(sample));
    }

    Ok(samples)
}

/// Float samples → PCM16 → base64, ready for the `data` field of a transport envelope.
pub fn encode_base64_pcm16(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16_le(samples))
}

/// base64 → PCM16 → float samples. Pure and deterministic.
pub fn decode_base64_pcm16(data: &str) -> AppResult<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
    decode_pcm16_le(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_to_pcm16_range_mapping() {
        assert_eq!(float_to_pcm16(0.0), 0);
        assert_eq!(float_to_pcm16(0.5), 16384);
        assert_eq!(float_to_pcm16(-0.5), -16384);
        assert_eq!(float_to_pcm16(-1.0), i16::MIN);
        // Full scale positive saturates instead of wrapping around
        assert_eq!(float_to_pcm16(1.0), i16::MAX);
        assert_eq!(float_to_pcm16(3.0), i16::MAX);
        assert_eq!(float_to_pcm16(-3.0), i16::MIN);
    }

    #[test]
    fn test_round_trip_within_quantization_error() {
        // A deterministic spread of values covering the whole range, edges included
        let samples: Vec<f32> = (0..2001)
            .map(|i| (-1.0 + i as f32 * 0.001).clamp(-1.0, 1.0))
            .collect();
        let decoded = decode_base64_pcm16(&encode_base64_pcm16(&samples)).unwrap();

        assert_eq!(decoded.len(), samples.len());
        // Half a step from rounding, one full step at the saturated top edge
        let tolerance = 1.0 / PCM16_SCALE + f32::EPSILON;
        for (original, restored) in samples.iter().zip(decoded.iter()) {
            assert!(
                (original - restored).abs() <= tolerance,
                "round trip drifted: {} vs {}",
                original,
                restored
            );
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = encode_pcm16_le(&[pcm16_to_float(0x0102), pcm16_to_float(-2)]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn test_decode_rejects_odd_length_and_bad_base64() {
        assert!(matches!(decode_pcm16_le(&[1, 2, 3]), Err(AppError::DecodeFailure(_))));
        assert!(matches!(decode_base64_pcm16("%%%"), Err(AppError::DecodeFailure(_))));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let payload = encode_base64_pcm16(&[0.1, -0.2, 0.3]);
        assert_eq!(
            decode_base64_pcm16(&payload).unwrap(),
            decode_base64_pcm16(&payload).unwrap()
        );
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(pcm_mime_type(16_000), "audio/pcm;rate=16000");
    }
}
