//! Data model shared between the practice engine and its collaborators:
//! exercise definitions, played-note logs, score breakdowns and settings.

pub mod error;
pub mod exercise;
pub mod performance;
pub mod scale;
pub mod settings;
pub mod source;

pub use error::ExerciseError;
pub use exercise::{ExerciseDefinition, ExerciseSettings, NoteEvent, ScoringConfig, TimeSignature};
pub use performance::{PlayedNoteEvent, ScoreBreakdown};
pub use scale::{KeySignature, ScaleType};
pub use settings::{EnginePreference, PlayerSettings};
pub use source::{InputSource, SourceProfile, SourceTable};

/// Lowest and highest keys on an 88-key piano.
pub const PIANO_LOWEST: u8 = 21;
pub const PIANO_HIGHEST: u8 = 108;
