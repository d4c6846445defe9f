//! Playback clock for viseme sequences.
//!
//! Elapsed time comes from the monotonic clock unless a live audio output is
//! attached, in which case the audio position wins whenever it is usable.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Read-only view of an audio output's progress.
///
/// Implemented by the remote audio output so the clock can follow what is
/// actually audible instead of wall time.
pub trait AudioProgress: Send + Sync {
    /// Whether playback is currently paused or starved.
    fn is_paused(&self) -> bool;

    /// Total audio played since the output was created.
    fn position(&self) -> Duration;
}

/// Elapsed-time source for one active sequence.
pub struct PlaybackClock {
    anchor: Instant,
    audio: Option<Arc<dyn AudioProgress>>,
    /// Audio position at the moment the sequence started.
    audio_base: Duration,
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("anchor", &self.anchor)
            .field("audio_attached", &self.audio.is_some())
            .field("audio_base", &self.audio_base)
            .finish()
    }
}

impl PlaybackClock {
    /// Anchor a new clock at `now`.
    pub fn start(now: Instant, audio: Option<Arc<dyn AudioProgress>>) -> Self {
        let audio_base = audio.as_ref().map_or(Duration::ZERO, |a| a.position());
        Self {
            anchor: now,
            audio,
            audio_base,
        }
    }

    /// Wall-clock milliseconds since the anchor.
    pub fn wall_elapsed_ms(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.anchor).as_secs_f64() * 1000.0
    }

    /// Audio milliseconds since the anchor, when the audio clock is usable.
    ///
    /// Usable means attached, not paused, and strictly ahead of where it was
    /// when the sequence started.
    pub fn audio_elapsed_ms(&self) -> Option<f64> {
        let audio = self.audio.as_ref()?;
        if audio.is_paused() {
            return None;
        }
        let advanced = audio.position().checked_sub(self.audio_base)?;
        (advanced > Duration::ZERO).then(|| advanced.as_secs_f64() * 1000.0)
    }

    /// Best available elapsed time.
    pub fn elapsed_ms(&self, now: Instant) -> f64 {
        self.audio_elapsed_ms()
            .unwrap_or_else(|| self.wall_elapsed_ms(now))
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}
