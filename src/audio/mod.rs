//! Microphone capture and remote audio output via cpal.

pub mod capture;
pub mod g711;
pub mod playback;

pub use capture::{CpalMicrophone, LocalAudio, LocalAudioFeed, MediaCapture};
pub use playback::{AudioOutput, PlaybackCursor, RemoteAudioOutput};

use std::time::Instant;

/// A chunk of mono audio samples.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the chunk was captured or received.
    pub captured_at: Instant,
}

/// Microphone level, published whenever `listening` flips.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputLevel {
    pub rms: f32,
    /// Whether `rms` is above the listening threshold.
    pub listening: bool,
}

/// Root-mean-square level of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation resampler.
///
/// Good enough for speech, where energy sits well below the Nyquist limit
/// of either rate.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}
