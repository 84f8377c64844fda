//! PCM16 frame codec
//!
//! Converts between captured float samples and the wire format used by the
//! realtime session: 16-bit signed little-endian PCM, base64-wrapped.
//! Pure functions, no I/O.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Full-scale value used for both directions of the conversion
pub const PCM16_SCALE: f32 = i16::MAX as f32;

/// Errors produced when an inbound payload cannot be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("payload is {0} bytes, not a whole number of 16-bit samples")]
    OddLength(usize),
}

/// Convert one float sample to PCM16.
///
/// Values are clamped to [-1, 1] and rounded to nearest (ties away from
/// zero). NaN maps to silence.
pub fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * PCM16_SCALE).round() as i16
}

/// Convert one PCM16 sample back to a float in [-1, 1]
pub fn i16_to_sample(sample: i16) -> f32 {
    (sample as f32 / PCM16_SCALE).max(-1.0)
}

/// Pack float samples as PCM16 little-endian bytes
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| sample_to_i16(s).to_le_bytes())
        .collect()
}

/// Encode float samples into a base64 PCM16LE payload ready for the transport
pub fn encode(samples: &[f32]) -> String {
    if samples.is_empty() {
        return String::new();
    }
    STANDARD.encode(encode_pcm16(samples))
}

/// Interpret little-endian bytes as PCM16 samples
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a base64 PCM16LE payload into float samples
pub fn decode(payload: &str) -> Result<Vec<f32>, CodecError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    Ok(decode_pcm16(&bytes)?
        .into_iter()
        .map(i16_to_sample)
        .collect())
}
