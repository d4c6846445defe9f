//! Spelling-based phoneme estimation.
//!
//! This is a heuristic tuned for English orthography, not a transcription
//! engine. Ambiguous spellings resolve to fixed defaults ("book" and "food"
//! both get `UW`).

/// Coarse ARPABET-style phoneme categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phoneme {
    // Vowels
    AA,
    AE,
    AH,
    AO,
    AW,
    AY,
    EH,
    ER,
    EY,
    IH,
    IY,
    OW,
    OY,
    UH,
    UW,
    // Consonants
    B,
    CH,
    D,
    DH,
    F,
    G,
    H,
    JH,
    K,
    L,
    M,
    N,
    NG,
    P,
    R,
    S,
    SH,
    T,
    TH,
    V,
    W,
    Y,
    Z,
    ZH,
    /// Pause between words, or a silent letter.
    Sil,
}

impl Phoneme {
    pub const ALL: [Phoneme; 40] = [
        Self::AA,
        Self::AE,
        Self::AH,
        Self::AO,
        Self::AW,
        Self::AY,
        Self::EH,
        Self::ER,
        Self::EY,
        Self::IH,
        Self::IY,
        Self::OW,
        Self::OY,
        Self::UH,
        Self::UW,
        Self::B,
        Self::CH,
        Self::D,
        Self::DH,
        Self::F,
        Self::G,
        Self::H,
        Self::JH,
        Self::K,
        Self::L,
        Self::M,
        Self::N,
        Self::NG,
        Self::P,
        Self::R,
        Self::S,
        Self::SH,
        Self::T,
        Self::TH,
        Self::V,
        Self::W,
        Self::Y,
        Self::Z,
        Self::ZH,
        Self::Sil,
    ];

    /// ARPABET code, `SIL` for silence.
    pub fn code(self) -> &'static str {
        match self {
            Self::AA => "AA",
            Self::AE => "AE",
            Self::AH => "AH",
            Self::AO => "AO",
            Self::AW => "AW",
            Self::AY => "AY",
            Self::EH => "EH",
            Self::ER => "ER",
            Self::EY => "EY",
            Self::IH => "IH",
            Self::IY => "IY",
            Self::OW => "OW",
            Self::OY => "OY",
            Self::UH => "UH",
            Self::UW => "UW",
            Self::B => "B",
            Self::CH => "CH",
            Self::D => "D",
            Self::DH => "DH",
            Self::F => "F",
            Self::G => "G",
            Self::H => "H",
            Self::JH => "JH",
            Self::K => "K",
            Self::L => "L",
            Self::M => "M",
            Self::N => "N",
            Self::NG => "NG",
            Self::P => "P",
            Self::R => "R",
            Self::S => "S",
            Self::SH => "SH",
            Self::T => "T",
            Self::TH => "TH",
            Self::V => "V",
            Self::W => "W",
            Self::Y => "Y",
            Self::Z => "Z",
            Self::ZH => "ZH",
            Self::Sil => "SIL",
        }
    }

    /// Parse a phoneme code from a direct hint.
    ///
    /// Stress digits are ignored (`AH0` is `AH`). A few loose spellings seen
    /// in hints are accepted as aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().trim_end_matches(['0', '1', '2']).to_ascii_uppercase();
        match code.as_str() {
            "EE" => return Some(Self::IY),
            "OO" => return Some(Self::UW),
            "OU" | "OH" => return Some(Self::OW),
            "E" => return Some(Self::EH),
            "PAUSE" | "SP" | "SIL" | "" => return Some(Self::Sil),
            _ => {}
        }
        Self::ALL.into_iter().find(|p| p.code() == code)
    }
}

impl std::fmt::Display for Phoneme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Estimate the phonemes of a single word.
///
/// Never returns an empty list: input with no recognizable letters yields a
/// single [`Phoneme::Sil`].
pub fn estimate(word: &str) -> Vec<Phoneme> {
    use Phoneme as P;

    let chars: Vec<char> = word.to_lowercase().chars().collect();
    let len = chars.len();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        if i + 3 <= len {
            let tri: &[P] = match (chars[i], chars[i + 1], chars[i + 2]) {
                ('i', 'g', 'h') => &[P::AY],
                ('a', 'r', 'd') => &[P::AA, P::R, P::D],
                ('e', 'a', 'r') => &[P::IY, P::R],
                ('o', 'u', 'r') => &[P::OW, P::R],
                _ => &[],
            };
            if !tri.is_empty() {
                out.extend_from_slice(tri);
                i += 3;
                continue;
            }
        }

        if i + 2 <= len {
            let after = chars.get(i + 2).copied();
            let di: &[P] = match (chars[i], chars[i + 1]) {
                ('t', 'h') => &[P::TH],
                ('s', 'h') => &[P::SH],
                ('c', 'h') => &[P::CH],
                ('n', 'g') => &[P::NG],
                ('p', 'h') => &[P::F],
                ('c', 'k') => &[P::K],
                ('q', 'u') => &[P::K, P::W],
                ('e', 'e') => &[P::IY],
                ('e', 'a') if matches!(after, Some('r' | 'd')) => &[P::EH],
                ('e', 'a') => &[P::IY],
                ('o', 'o') => &[P::UW],
                ('o', 'u') => &[P::AW],
                ('o', 'w') => &[P::OW],
                ('a', 'i' | 'y') | ('e', 'i' | 'y') => &[P::EY],
                ('i', 'e') => &[P::IY],
                ('o', 'a') => &[P::OW],
                ('u', 'e' | 'i') => &[P::UW],
                ('e', 'r') | ('u', 'r') | ('i', 'r') => &[P::ER],
                ('a', 'r') => &[P::AA, P::R],
                ('o', 'r') => &[P::AO, P::R],
                _ => &[],
            };
            if !di.is_empty() {
                out.extend_from_slice(di);
                i += 2;
                continue;
            }
        }

        let next = chars.get(i + 1).copied();
        let last = i + 1 == len;
        match chars[i] {
            'a' if matches!(next, Some('w' | 'l')) => out.push(P::AO),
            'a' => out.push(P::AE),
            'e' if last => out.push(P::Sil),
            'e' => out.push(P::EH),
            'i' => out.push(P::IH),
            'o' => out.push(P::AO),
            'u' => out.push(P::UH),
            'y' if i == 0 => out.push(P::Y),
            'y' if last => out.push(P::IY),
            'y' => out.push(P::IH),
            'p' => out.push(P::P),
            'b' => out.push(P::B),
            't' => out.push(P::T),
            'd' => out.push(P::D),
            'k' => out.push(P::K),
            'g' => out.push(P::G),
            'f' => out.push(P::F),
            'v' => out.push(P::V),
            's' => out.push(P::S),
            'z' => out.push(P::Z),
            'm' => out.push(P::M),
            'n' => out.push(P::N),
            'l' => out.push(P::L),
            'r' => out.push(P::R),
            'w' => out.push(P::W),
            'h' => out.push(P::H),
            'j' => out.push(P::JH),
            'c' if matches!(next, Some('e' | 'i' | 'y')) => out.push(P::S),
            'c' => out.push(P::K),
            'x' => out.extend_from_slice(&[P::K, P::S]),
            _ => {}
        }
        i += 1;
    }

    if out.is_empty() {
        out.push(P::Sil);
    }
    out
}
