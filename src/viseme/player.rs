//! Viseme player: one active sequence, a bounded pending queue, and a sink.
//!
//! The player is a plain state machine driven by [`VisemePlayer::tick`]. It
//! never sleeps or spawns; [`super::driver`] owns the frame cadence.

use super::clock::{AudioProgress, PlaybackClock};
use super::schedule::VisemeSequence;
use super::VisemeFrame;
use crate::config::LipSyncConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of one assistant response, as sent by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseId(String);

impl ResponseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Local id for events that arrive without one.
    pub fn synthesize() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResponseId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Receives mouth shapes as they change.
///
/// The renderer side implements this. Calls only happen when the emitted
/// frame differs from the previous one.
pub trait VisemeSink: Send {
    fn emit(&mut self, frame: VisemeFrame);
}

impl<F> VisemeSink for F
where
    F: FnMut(VisemeFrame) + Send,
{
    fn emit(&mut self, frame: VisemeFrame) {
        self(frame)
    }
}

struct ActivePlayback {
    id: ResponseId,
    sequence: VisemeSequence,
    clock: PlaybackClock,
}

struct PendingSequence {
    id: ResponseId,
    sequence: VisemeSequence,
    queued_at: Instant,
}

pub struct VisemePlayer {
    sink: Box<dyn VisemeSink>,
    pending: VecDeque<PendingSequence>,
    active: Option<ActivePlayback>,
    /// Start request that arrived before its sequence.
    awaiting_start: Option<(ResponseId, Instant)>,
    audio: Option<Arc<dyn AudioProgress>>,
    last_emitted: Option<VisemeFrame>,
    trailing_buffer: Duration,
    max_pending: usize,
    promotion_window: Duration,
}

impl VisemePlayer {
    pub fn new(config: &LipSyncConfig, sink: Box<dyn VisemeSink>) -> Self {
        Self {
            sink,
            pending: VecDeque::new(),
            active: None,
            awaiting_start: None,
            audio: None,
            last_emitted: None,
            trailing_buffer: Duration::from_millis(config.trailing_buffer_ms),
            max_pending: config.max_pending.max(1),
            promotion_window: Duration::from_millis(config.promotion_window_ms),
        }
    }

    /// Use `audio` as the clock reference for sequences started from now on.
    pub fn attach_audio(&mut self, audio: Option<Arc<dyn AudioProgress>>) {
        self.audio = audio;
    }

    /// Store a sequence without playing it.
    ///
    /// If a start for `id` was requested recently the sequence is promoted
    /// straight away. Returns whether playback started.
    pub fn queue_sequence(
        &mut self,
        id: ResponseId,
        sequence: VisemeSequence,
        now: Instant,
    ) -> bool {
        self.pending.retain(|p| p.id != id);
        self.pending.push_back(PendingSequence {
            id: id.clone(),
            sequence,
            queued_at: now,
        });
        while self.pending.len() > self.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                tracing::debug!(response = %evicted.id, "evicting oldest pending viseme sequence");
            }
        }

        let window = self.promotion_window;
        let awaited = self.awaiting_start.as_ref().is_some_and(|(want, at)| {
            *want == id && now.saturating_duration_since(*at) <= window
        });
        if awaited {
            self.start_for_response(&id, now)
        } else {
            false
        }
    }

    /// Promote the queued sequence for `id`, replacing whatever is playing.
    ///
    /// Returns `false` when `id` is already active, or when nothing is queued
    /// for it yet. In the latter case the request is remembered and honored if
    /// the sequence arrives within the promotion window.
    pub fn start_for_response(&mut self, id: &ResponseId, now: Instant) -> bool {
        if self.active.as_ref().is_some_and(|a| &a.id == id) {
            return false;
        }
        let Some(pos) = self.pending.iter().position(|p| &p.id == id) else {
            tracing::debug!(response = %id, "start requested before sequence was queued");
            self.awaiting_start = Some((id.clone(), now));
            return false;
        };
        let Some(next) = self.pending.remove(pos) else {
            return false;
        };
        if self.awaiting_start.as_ref().is_some_and(|(want, _)| want == id) {
            self.awaiting_start = None;
        }
        if let Some(prev) = self.active.take() {
            tracing::debug!(previous = %prev.id, next = %id, "superseding active viseme sequence");
        }

        tracing::debug!(
            response = %id,
            entries = next.sequence.len(),
            duration_ms = next.sequence.duration_ms(),
            waited_ms = now.saturating_duration_since(next.queued_at).as_millis() as u64,
            "starting viseme playback"
        );
        self.active = Some(ActivePlayback {
            id: next.id,
            sequence: next.sequence,
            clock: PlaybackClock::start(now, self.audio.clone()),
        });
        true
    }

    /// Advance playback to `now`, emitting the current frame if it changed.
    pub fn tick(&mut self, now: Instant) {
        if let Some((_, at)) = &self.awaiting_start
            && now.saturating_duration_since(*at) > self.promotion_window
        {
            self.awaiting_start = None;
        }

        let Some(active) = &self.active else {
            return;
        };
        // Auto-stop follows wall time even when audio lags or never advances.
        let wall = active.clock.wall_elapsed_ms(now);
        let limit = active.sequence.duration_ms() + self.trailing_buffer.as_secs_f64() * 1000.0;
        if wall > limit {
            tracing::debug!(response = %active.id, elapsed_ms = wall, "viseme sequence finished");
            self.active = None;
            self.emit(VisemeFrame::SILENCE);
            return;
        }

        let elapsed = active.clock.elapsed_ms(now);
        let frame = active
            .sequence
            .entry_at(elapsed)
            .map_or(VisemeFrame::SILENCE, |e| e.frame());
        self.emit(frame);
    }

    /// Emit a directly supplied frame, outside any schedule.
    pub fn emit_hint(&mut self, frame: VisemeFrame) {
        self.emit(frame);
    }

    /// Halt playback and drop every queued or remembered sequence.
    ///
    /// Emits silence unless silence was already the last frame, so calling
    /// this repeatedly is harmless.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(response = %active.id, "viseme playback stopped");
        }
        self.pending.clear();
        self.awaiting_start = None;
        self.emit(VisemeFrame::SILENCE);
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_response(&self) -> Option<&ResponseId> {
        self.active.as_ref().map(|a| &a.id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_queued(&self, id: &ResponseId) -> bool {
        self.pending.iter().any(|p| &p.id == id)
    }

    pub fn last_emitted(&self) -> Option<VisemeFrame> {
        self.last_emitted
    }

    fn emit(&mut self, frame: VisemeFrame) {
        if self.last_emitted == Some(frame) {
            return;
        }
        tracing::trace!(viseme = %frame.viseme, intensity = frame.intensity, "viseme");
        self.last_emitted = Some(frame);
        self.sink.emit(frame);
    }
}
