//! G.711 µ-law (PCMU) codec for the peer audio tracks.
//!
//! PCMU runs at 8kHz mono. Outgoing audio is resampled and cut into fixed
//! packet-sized frames; incoming payloads decode straight to f32 samples.

use super::resample;
use std::time::Duration;

/// PCMU clock rate in Hz.
pub const PCMU_RATE: u32 = 8_000;

/// Samples per 20ms packet at [`PCMU_RATE`].
pub const FRAME_SAMPLES: usize = 160;

/// Playout duration of one full frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Encode one 16-bit linear sample.
pub fn encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = i32::from(sample).abs().min(CLIP) + BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode one µ-law byte to 16-bit linear.
pub fn decode_sample(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    let value = if byte & 0x80 != 0 { -magnitude } else { magnitude };
    value as i16
}

/// Decode a PCMU payload to f32 samples in `[-1.0, 1.0]`.
pub fn decode(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&b| f32::from(decode_sample(b)) / 32_768.0)
        .collect()
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32_767.0) as i16
}

/// Turns captured mono audio into whole 20ms PCMU frames.
///
/// Leftover samples are carried into the next push, so frames stay evenly
/// sized whatever the capture block size.
#[derive(Debug)]
pub struct PcmuPacketizer {
    input_rate: u32,
    carry: Vec<u8>,
}

impl PcmuPacketizer {
    pub fn new(input_rate: u32) -> Self {
        Self {
            input_rate,
            carry: Vec::with_capacity(FRAME_SAMPLES * 2),
        }
    }

    /// Add one captured block. Returns every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        let narrow = resample(samples, self.input_rate, PCMU_RATE);
        self.carry
            .extend(narrow.into_iter().map(|s| encode_sample(to_i16(s))));

        let whole = self.carry.len() / FRAME_SAMPLES * FRAME_SAMPLES;
        let frames = self.carry[..whole]
            .chunks_exact(FRAME_SAMPLES)
            .map(<[u8]>::to_vec)
            .collect();
        self.carry.drain(..whole);
        frames
    }

    /// Encoded samples waiting for a full frame.
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }
}
