use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ExerciseError;
use crate::scale::KeySignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature(pub u8, pub u8);

impl Default for TimeSignature {
    fn default() -> Self {
        Self(4, 4)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseSettings {
    pub tempo_bpm: f64,
    #[serde(default)]
    pub count_in_beats: u32,
    #[serde(default)]
    pub time_signature: TimeSignature,
    #[serde(default)]
    pub key_signature: KeySignature,
    #[serde(default)]
    pub loop_enabled: bool,
}

impl Default for ExerciseSettings {
    fn default() -> Self {
        Self {
            tempo_bpm: 120.0,
            count_in_beats: 4,
            time_signature: TimeSignature::default(),
            key_signature: KeySignature::default(),
            loop_enabled: false,
        }
    }
}

/// One expected note of an exercise, positioned in beats from the end of the count-in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEvent {
    pub pitch: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
    #[serde(default)]
    pub optional: bool,
}

impl NoteEvent {
    pub fn new(pitch: u8, start_beat: f64, duration_beats: f64) -> Self {
        Self { pitch, start_beat, duration_beats, optional: false }
    }

    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    pub timing_tolerance_ms: f64,
    #[serde(default)]
    pub timing_grace_period_ms: f64,
    pub passing_score: f64,
    pub star_thresholds: [f64; 3],
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            timing_tolerance_ms: 50.0,
            timing_grace_period_ms: 150.0,
            passing_score: 60.0,
            star_thresholds: [70.0, 85.0, 95.0],
        }
    }
}

/// Immutable exercise as delivered by the content loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub settings: ExerciseSettings,
    pub notes: Vec<NoteEvent>,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Default for ExerciseDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: "New Exercise".to_string(),
            settings: ExerciseSettings::default(),
            notes: Vec::new(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl ExerciseDefinition {
    pub fn from_json_str(json: &str) -> Result<Self, ExerciseError> {
        let exercise: Self = serde_json::from_str(json)?;
        exercise.validate()?;
        Ok(exercise)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ExerciseError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ExerciseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Milliseconds per beat. Falls back to 120 BPM when the tempo is unusable
    /// so downstream arithmetic never divides by zero.
    pub fn ms_per_beat(&self) -> f64 {
        let bpm = self.settings.tempo_bpm;
        if bpm.is_finite() && bpm > 0.0 {
            60_000.0 / bpm
        } else {
            500.0
        }
    }

    /// Expected onset of a note in ms after beat 0.
    pub fn expected_time_ms(&self, note: &NoteEvent) -> f64 {
        note.start_beat * self.ms_per_beat()
    }

    pub fn expected_duration_ms(&self, note: &NoteEvent) -> f64 {
        note.duration_beats * self.ms_per_beat()
    }

    /// Latest `start + duration` over all notes, 0 for an empty exercise.
    pub fn last_expected_end_beat(&self) -> f64 {
        self.notes.iter().map(NoteEvent::end_beat).fold(0.0, f64::max)
    }

    pub fn required_note_count(&self) -> usize {
        self.notes.iter().filter(|n| !n.optional).count()
    }

    /// Count-in duration in ms.
    pub fn count_in_ms(&self) -> f64 {
        self.settings.count_in_beats as f64 * self.ms_per_beat()
    }

    pub fn validate(&self) -> Result<(), ExerciseError> {
        let tempo = self.settings.tempo_bpm;
        if !(tempo.is_finite() && tempo > 0.0) {
            return Err(ExerciseError::InvalidTempo(tempo));
        }
        let TimeSignature(num, den) = self.settings.time_signature;
        if num == 0 || den == 0 || !den.is_power_of_two() {
            return Err(ExerciseError::InvalidTimeSignature(num, den));
        }
        if self.notes.is_empty() {
            return Err(ExerciseError::NoNotes);
        }
        for (index, note) in self.notes.iter().enumerate() {
            if note.pitch > 127 {
                return Err(ExerciseError::PitchOutOfRange { index, pitch: note.pitch as u32 });
            }
            if !(note.start_beat.is_finite() && note.start_beat >= 0.0) {
                return Err(ExerciseError::NegativeStart { index, start: note.start_beat });
            }
            if !(note.duration_beats.is_finite() && note.duration_beats > 0.0) {
                return Err(ExerciseError::InvalidDuration { index, duration: note.duration_beats });
            }
        }
        self.scoring.validate()
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ExerciseError> {
        if !(self.timing_tolerance_ms.is_finite() && self.timing_tolerance_ms > 0.0) {
            return Err(ExerciseError::InvalidTolerance(self.timing_tolerance_ms));
        }
        if !(self.timing_grace_period_ms.is_finite() && self.timing_grace_period_ms >= 0.0) {
            return Err(ExerciseError::InvalidGracePeriod(self.timing_grace_period_ms));
        }
        if !(0.0..=100.0).contains(&self.passing_score) {
            return Err(ExerciseError::InvalidPassingScore(self.passing_score));
        }
        let [t1, t2, t3] = self.star_thresholds;
        let in_range = self.star_thresholds.iter().all(|t| (0.0..=100.0).contains(t));
        if !(in_range && t1 < t2 && t2 < t3) {
            return Err(ExerciseError::UnorderedStarThresholds(self.star_thresholds));
        }
        if self.passing_score > t1 {
            return Err(ExerciseError::PassingAboveFirstStar { passing: self.passing_score, first: t1 });
        }
        Ok(())
    }
}
