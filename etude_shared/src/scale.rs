use serde::{Deserialize, Serialize};
use std::fmt;

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleType {
    Chromatic,
    #[default]
    Major,
    Minor,

    // Church modes
    Dorian,
    Phrygian,
    Lydian,
    Mixolydian,
    Locrian,

    HarmonicMinor,
    MelodicMinor,

    MajorPentatonic,
    MinorPentatonic,
    Blues,
}

impl ScaleType {
    pub fn get_intervals(&self) -> &'static [u8] {
        match self {
            ScaleType::Chromatic => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
            ScaleType::Major => &[0, 2, 4, 5, 7, 9, 11],
            ScaleType::Minor => &[0, 2, 3, 5, 7, 8, 10],

            ScaleType::Dorian => &[0, 2, 3, 5, 7, 9, 10],
            ScaleType::Phrygian => &[0, 1, 3, 5, 7, 8, 10],
            ScaleType::Lydian => &[0, 2, 4, 6, 7, 9, 11],
            ScaleType::Mixolydian => &[0, 2, 4, 5, 7, 9, 10],
            ScaleType::Locrian => &[0, 1, 3, 5, 6, 8, 10],

            ScaleType::HarmonicMinor => &[0, 2, 3, 5, 7, 8, 11],
            ScaleType::MelodicMinor => &[0, 2, 3, 5, 7, 9, 11],

            ScaleType::MajorPentatonic => &[0, 2, 4, 7, 9],
            ScaleType::MinorPentatonic => &[0, 3, 5, 7, 10],
            ScaleType::Blues => &[0, 3, 5, 6, 7, 10],
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            ScaleType::Chromatic => " chromatic",
            ScaleType::Major => "",
            ScaleType::Minor => "m",
            ScaleType::Dorian => " dorian",
            ScaleType::Phrygian => " phrygian",
            ScaleType::Lydian => " lydian",
            ScaleType::Mixolydian => " mixolydian",
            ScaleType::Locrian => " locrian",
            ScaleType::HarmonicMinor => " harmonic minor",
            ScaleType::MelodicMinor => " melodic minor",
            ScaleType::MajorPentatonic => " major pentatonic",
            ScaleType::MinorPentatonic => " minor pentatonic",
            ScaleType::Blues => " blues",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Some(match s.as_str() {
            "" | "maj" | "major" => ScaleType::Major,
            "m" | "min" | "minor" => ScaleType::Minor,
            "chromatic" => ScaleType::Chromatic,
            "dorian" => ScaleType::Dorian,
            "phrygian" => ScaleType::Phrygian,
            "lydian" => ScaleType::Lydian,
            "mixolydian" => ScaleType::Mixolydian,
            "locrian" => ScaleType::Locrian,
            "harmonic minor" => ScaleType::HarmonicMinor,
            "melodic minor" => ScaleType::MelodicMinor,
            "major pentatonic" => ScaleType::MajorPentatonic,
            "minor pentatonic" => ScaleType::MinorPentatonic,
            "blues" => ScaleType::Blues,
            _ => return None,
        })
    }
}

/// Key of an exercise, e.g. `"C"`, `"F#m"`, `"Bb dorian"`.
///
/// Serialized as its display string so exercise files stay human-editable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeySignature {
    /// Pitch class of the tonic (0 = C).
    pub root: u8,
    pub scale: ScaleType,
}

impl Default for KeySignature {
    fn default() -> Self {
        Self { root: 0, scale: ScaleType::Major }
    }
}

impl KeySignature {
    pub fn new(root: u8, scale: ScaleType) -> Self {
        Self { root: root % 12, scale }
    }

    /// True if the pitch belongs to the key's scale.
    pub fn contains(&self, pitch: u8) -> bool {
        let rel_class = (pitch % 12 + 12 - self.root) % 12;
        self.scale.get_intervals().contains(&rel_class)
    }

    /// Snap a pitch to the nearest in-key pitch (ties resolve downward).
    pub fn quantize(&self, pitch: u8) -> u8 {
        quantize(pitch, self.root, self.scale)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let mut chars = text.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let base: i32 = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let rest = chars.as_str();
        let (accidental, rest) = if let Some(r) = rest.strip_prefix('#') {
            (1, r)
        } else if let Some(r) = rest.strip_prefix('b') {
            (-1, r)
        } else {
            (0, rest)
        };
        let scale = ScaleType::from_suffix(rest)?;
        Some(Self::new((base + accidental).rem_euclid(12) as u8, scale))
    }
}

impl fmt::Display for KeySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", NOTE_NAMES[(self.root % 12) as usize], self.scale.suffix())
    }
}

impl TryFrom<String> for KeySignature {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        KeySignature::parse(&value).ok_or_else(|| format!("unrecognised key signature '{}'", value))
    }
}

impl From<KeySignature> for String {
    fn from(key: KeySignature) -> Self {
        key.to_string()
    }
}

/// Scientific pitch name, middle C (60) = "C4".
pub fn note_name(pitch: u8) -> String {
    let octave = (pitch / 12) as i32 - 1;
    format!("{}{}", NOTE_NAMES[(pitch % 12) as usize], octave)
}

/// Equal-tempered frequency, A4 (69) = 440 Hz.
pub fn midi_to_frequency(pitch: u8) -> f32 {
    440.0 * 2.0_f32.powf((pitch as f32 - 69.0) / 12.0)
}

/// Nearest MIDI pitch for a frequency, with the residual in cents.
pub fn frequency_to_midi(freq: f32) -> Option<(u8, f32)> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let exact = 69.0 + 12.0 * (freq / 440.0).log2();
    let nearest = exact.round();
    if !(0.0..=127.0).contains(&nearest) {
        return None;
    }
    Some((nearest as u8, (exact - nearest) * 100.0))
}

/// Quantizes a note to the nearest note in the scale relative to a root key.
pub fn quantize(note: u8, root: u8, scale: ScaleType) -> u8 {
    if scale == ScaleType::Chromatic {
        return note;
    }

    let intervals = scale.get_intervals();
    let root_class = root % 12;
    let rel_class = (note % 12 + 12 - root_class) % 12;
    if intervals.contains(&rel_class) {
        return note;
    }

    // Candidates in the current, previous and next octave.
    let octave = note / 12;
    let mut best_note = note;
    let mut min_abs_dist = i32::MAX;

    for offset in -1..=1 {
        let base_octave = (octave as i32 + offset).max(0) as u32;
        for &iv in intervals {
            let note_val = base_octave * 12 + ((root_class + iv) % 12) as u32;
            if note_val > 127 {
                continue;
            }
            let dist = (note as i32 - note_val as i32).abs();
            if dist < min_abs_dist || (dist == min_abs_dist && (note_val as u8) < best_note) {
                min_abs_dist = dist;
                best_note = note_val as u8;
            }
        }
    }

    best_note
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_signatures() {
        assert_eq!(KeySignature::parse("C"), Some(KeySignature::new(0, ScaleType::Major)));
        assert_eq!(KeySignature::parse("F#m"), Some(KeySignature::new(6, ScaleType::Minor)));
        assert_eq!(KeySignature::parse("Bb dorian"), Some(KeySignature::new(10, ScaleType::Dorian)));
        assert_eq!(KeySignature::parse("H"), None);
        assert_eq!(KeySignature::parse("C weird"), None);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let key = KeySignature::new(9, ScaleType::Minor);
        assert_eq!(key.to_string(), "Am");
        assert_eq!(KeySignature::parse(&key.to_string()), Some(key));
    }

    #[test]
    fn test_contains_and_quantize() {
        let c_major = KeySignature::default();
        assert!(c_major.contains(60));
        assert!(!c_major.contains(61));
        // C# is equidistant from C and D, resolves downward.
        assert_eq!(c_major.quantize(61), 60);
        assert_eq!(c_major.quantize(62), 62);
    }

    #[test]
    fn test_pitch_helpers() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert!((midi_to_frequency(69) - 440.0).abs() < 1e-3);
        let (pitch, cents) = frequency_to_midi(261.63).unwrap();
        assert_eq!(pitch, 60);
        assert!(cents.abs() < 1.0);
        assert_eq!(frequency_to_midi(0.0), None);
    }
}
