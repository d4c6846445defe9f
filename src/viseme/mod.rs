//! Viseme mapping and playback for lip-sync animation.
//!
//! A viseme is a visual mouth shape that corresponds to a phoneme (sound).
//! Text is turned into coarse phonemes ([`phoneme`]), scheduled into timed
//! windows ([`schedule`]) and played back against an audio-aware clock
//! ([`clock`], [`player`]). [`driver`] runs the player as its own task.

pub mod clock;
pub mod driver;
pub mod phoneme;
pub mod player;
pub mod schedule;

pub use clock::{AudioProgress, PlaybackClock};
pub use driver::{LipSyncDriver, LipSyncHandle, LipSyncSnapshot};
pub use phoneme::Phoneme;
pub use player::{ResponseId, VisemePlayer, VisemeSink};
pub use schedule::{ScheduledViseme, UtteranceScheduler, VisemeSequence};

use serde::{Deserialize, Serialize};

/// Oculus viseme IDs (standard for lip-sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Viseme {
    /// Silence (mouth closed)
    #[serde(rename = "viseme_sil")]
    Sil = 0,
    /// /p/, /b/, /m/ (lips pressed together)
    #[serde(rename = "viseme_PP")]
    PP = 1,
    /// /f/, /v/ (teeth on lip)
    #[serde(rename = "viseme_FF")]
    FF = 2,
    /// /θ/, /ð/ (tongue between teeth)
    #[serde(rename = "viseme_TH")]
    TH = 3,
    /// /t/, /d/, /n/, /l/ (tongue at roof)
    #[serde(rename = "viseme_DD")]
    DD = 4,
    /// /k/, /g/, /ŋ/ (back of tongue up)
    #[serde(rename = "viseme_kk")]
    KK = 5,
    /// /tʃ/, /dʒ/ (tongue curved)
    #[serde(rename = "viseme_CH")]
    CH = 6,
    /// /s/, /z/, /ʃ/, /ʒ/ (teeth together, tongue forward)
    #[serde(rename = "viseme_SS")]
    SS = 7,
    /// /n/, /nj/
    #[serde(rename = "viseme_nn")]
    NN = 8,
    /// /r/ (tongue curled)
    #[serde(rename = "viseme_RR")]
    RR = 9,
    /// /a/ (mouth open wide)
    #[serde(rename = "viseme_aa")]
    AA = 10,
    /// /e/ (mouth medium)
    #[serde(rename = "viseme_E")]
    E = 11,
    /// /i/ (mouth wide, teeth apart)
    #[serde(rename = "viseme_I")]
    I = 12,
    /// /o/, /u/ (rounded)
    #[serde(rename = "viseme_O")]
    O = 13,
}

impl Viseme {
    pub const ALL: [Viseme; 14] = [
        Self::Sil,
        Self::PP,
        Self::FF,
        Self::TH,
        Self::DD,
        Self::KK,
        Self::CH,
        Self::SS,
        Self::NN,
        Self::RR,
        Self::AA,
        Self::E,
        Self::I,
        Self::O,
    ];

    /// Oculus wire name, e.g. `viseme_PP`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sil => "viseme_sil",
            Self::PP => "viseme_PP",
            Self::FF => "viseme_FF",
            Self::TH => "viseme_TH",
            Self::DD => "viseme_DD",
            Self::KK => "viseme_kk",
            Self::CH => "viseme_CH",
            Self::SS => "viseme_SS",
            Self::NN => "viseme_nn",
            Self::RR => "viseme_RR",
            Self::AA => "viseme_aa",
            Self::E => "viseme_E",
            Self::I => "viseme_I",
            Self::O => "viseme_O",
        }
    }

    /// Parse a wire name, with or without the `viseme_` prefix.
    ///
    /// Matching is case-insensitive. The Oculus `U` shape has no slot of its
    /// own here and folds into [`Viseme::O`].
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let bare = trimmed
            .get(..7)
            .filter(|p| p.eq_ignore_ascii_case("viseme_"))
            .map_or(trimmed, |_| &trimmed[7..]);
        if bare.eq_ignore_ascii_case("u") || bare.eq_ignore_ascii_case("ou") {
            return Some(Self::O);
        }
        Self::ALL
            .into_iter()
            .find(|v| v.as_str()[7..].eq_ignore_ascii_case(bare))
    }

    pub fn is_silence(self) -> bool {
        self == Self::Sil
    }
}

impl std::fmt::Display for Viseme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phoneme to viseme lookup. Total and many-to-one.
pub fn map_to_viseme(phoneme: Phoneme) -> Viseme {
    use Phoneme as P;
    match phoneme {
        P::AA | P::AE | P::AH | P::AO | P::AY | P::AW => Viseme::AA,
        P::OW | P::OY | P::UH | P::UW | P::W => Viseme::O,
        P::IY | P::IH | P::Y => Viseme::I,
        P::EH | P::EY => Viseme::E,
        P::P | P::B | P::M => Viseme::PP,
        P::F | P::V => Viseme::FF,
        P::S | P::Z | P::SH | P::ZH => Viseme::SS,
        P::TH | P::DH => Viseme::TH,
        P::T | P::D | P::N | P::L => Viseme::DD,
        P::K | P::G | P::NG => Viseme::KK,
        P::CH | P::JH => Viseme::CH,
        P::R | P::ER => Viseme::RR,
        P::H | P::Sil => Viseme::Sil,
    }
}

/// Mapping used for phoneme hints sent directly by the remote service.
///
/// Coarser than [`map_to_viseme`]: dentals fold into `SS`, nasals get their
/// own `nn` shape, and anything without a clear mouth shape is silence.
pub fn map_hint_to_viseme(phoneme: Phoneme) -> Viseme {
    use Phoneme as P;
    match phoneme {
        P::AA | P::AE | P::AH | P::AO => Viseme::AA,
        P::OW | P::OY | P::UH | P::UW => Viseme::O,
        P::IY | P::IH => Viseme::I,
        P::EH | P::EY | P::AY => Viseme::E,
        P::S | P::Z | P::SH | P::ZH | P::TH | P::DH => Viseme::SS,
        P::F | P::V => Viseme::FF,
        P::CH | P::JH => Viseme::CH,
        P::P | P::B | P::M => Viseme::PP,
        P::T | P::D => Viseme::DD,
        P::K | P::G => Viseme::KK,
        P::N | P::NG => Viseme::NN,
        P::R | P::ER => Viseme::RR,
        P::AW | P::L | P::W | P::Y | P::H | P::Sil => Viseme::Sil,
    }
}

/// Resolve a hint label: a viseme wire name or a phoneme code.
///
/// Unknown labels resolve to silence.
pub fn resolve_hint_label(raw: &str) -> Viseme {
    let raw = raw.trim();
    if raw.starts_with("viseme_") {
        return Viseme::parse(raw).unwrap_or(Viseme::Sil);
    }
    Phoneme::parse(raw).map_or(Viseme::Sil, map_hint_to_viseme)
}

/// One emitted mouth shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisemeFrame {
    pub viseme: Viseme,
    /// Mouth-opening weight in `[0, 1]`.
    pub intensity: f32,
}

impl VisemeFrame {
    pub const SILENCE: VisemeFrame = VisemeFrame {
        viseme: Viseme::Sil,
        intensity: 0.0,
    };

    pub fn new(viseme: Viseme, intensity: f32) -> Self {
        if viseme.is_silence() {
            return Self::SILENCE;
        }
        let intensity = if intensity.is_finite() {
            intensity.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self { viseme, intensity }
    }
}
