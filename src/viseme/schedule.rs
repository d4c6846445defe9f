//! Utterance scheduling: text to a timed viseme sequence.

use super::phoneme::{self, Phoneme};
use super::{Viseme, VisemeFrame, map_to_viseme};
use crate::config::LipSyncConfig;

/// One timed mouth shape within a sequence. Windows are `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledViseme {
    pub viseme: Viseme,
    pub phoneme: Phoneme,
    pub start_ms: f64,
    pub end_ms: f64,
    pub intensity: f32,
}

impl ScheduledViseme {
    pub fn frame(&self) -> VisemeFrame {
        VisemeFrame {
            viseme: self.viseme,
            intensity: self.intensity,
        }
    }
}

/// A complete schedule for one utterance.
///
/// Entries are contiguous, start at 0, and the last one ends at
/// [`duration_ms`](Self::duration_ms).
#[derive(Debug, Clone, PartialEq)]
pub struct VisemeSequence {
    entries: Vec<ScheduledViseme>,
    duration_ms: f64,
    text: String,
}

impl VisemeSequence {
    pub fn entries(&self) -> &[ScheduledViseme] {
        &self.entries
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    /// The utterance this sequence was built from.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry whose window contains `elapsed_ms`, if any.
    pub fn entry_at(&self, elapsed_ms: f64) -> Option<&ScheduledViseme> {
        if elapsed_ms.is_nan() || elapsed_ms < 0.0 || elapsed_ms >= self.duration_ms {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.end_ms <= elapsed_ms);
        self.entries.get(idx).filter(|e| e.start_ms <= elapsed_ms)
    }
}

/// Split text into words and estimate phonemes, with one pause between words.
pub fn text_to_phonemes(text: &str) -> Vec<Phoneme> {
    let mut out = Vec::new();
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .collect();

    for (idx, word) in words.iter().enumerate() {
        if idx > 0 {
            out.push(Phoneme::Sil);
        }
        out.extend(phoneme::estimate(word));
    }
    out
}

/// Builds [`VisemeSequence`]s from text using the configured heuristics.
#[derive(Debug, Clone)]
pub struct UtteranceScheduler {
    config: LipSyncConfig,
}

impl Default for UtteranceScheduler {
    fn default() -> Self {
        Self::new(LipSyncConfig::default())
    }
}

impl UtteranceScheduler {
    pub fn new(config: LipSyncConfig) -> Self {
        Self { config }
    }

    /// Estimated speaking time for `text` when the real duration is unknown.
    pub fn estimate_duration_ms(&self, text: &str, phoneme_count: usize) -> f64 {
        let words = text.split_whitespace().count() as f64;
        let chars = text.trim().chars().count() as f64;
        (words * self.config.ms_per_word)
            .max(chars * self.config.ms_per_char)
            .max(phoneme_count as f64 * self.config.ms_per_phoneme)
    }

    /// Schedule `text`. A finite, positive `known_duration_ms` overrides the
    /// estimate.
    pub fn schedule(&self, text: &str, known_duration_ms: Option<f64>) -> VisemeSequence {
        let mut phonemes = text_to_phonemes(text);
        if phonemes.is_empty() {
            phonemes.push(Phoneme::Sil);
        }

        let total = known_duration_ms
            .filter(|d| d.is_finite() && *d > 0.0)
            .unwrap_or_else(|| self.estimate_duration_ms(text, phonemes.len()));
        let count = phonemes.len();
        let even = total / count as f64;
        let (step, duration_ms) = if even >= self.config.min_phoneme_ms {
            (even, total)
        } else {
            let floor = self.config.min_phoneme_ms;
            (floor, floor * count as f64)
        };

        // The last window is pinned to the total so rounding never leaves a gap.
        let entries: Vec<ScheduledViseme> = phonemes
            .iter()
            .enumerate()
            .map(|(i, &phoneme)| {
                let viseme = map_to_viseme(phoneme);
                let end_ms = if i + 1 == count {
                    duration_ms
                } else {
                    (i + 1) as f64 * step
                };
                ScheduledViseme {
                    viseme,
                    phoneme,
                    start_ms: i as f64 * step,
                    end_ms,
                    intensity: self.intensity_for(viseme),
                }
            })
            .collect();

        tracing::trace!(entries = entries.len(), duration_ms, "scheduled utterance");

        VisemeSequence {
            entries,
            duration_ms,
            text: text.to_owned(),
        }
    }

    fn intensity_for(&self, viseme: Viseme) -> f32 {
        match viseme {
            Viseme::Sil => 0.0,
            Viseme::PP => self.config.bilabial_intensity,
            Viseme::FF => self.config.labiodental_intensity,
            _ => 1.0,
        }
    }
}
