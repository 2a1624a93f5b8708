use thiserror::Error;

/// Reasons an exercise definition or settings file is rejected.
#[derive(Debug, Error)]
pub enum ExerciseError {
    #[error("tempo must be positive, got {0}")]
    InvalidTempo(f64),
    #[error("time signature {0}/{1} is not valid")]
    InvalidTimeSignature(u8, u8),
    #[error("exercise has no notes")]
    NoNotes,
    #[error("note {index}: pitch {pitch} is outside 0..=127")]
    PitchOutOfRange { index: usize, pitch: u32 },
    #[error("note {index}: start beat {start} must be >= 0")]
    NegativeStart { index: usize, start: f64 },
    #[error("note {index}: duration {duration} must be > 0")]
    InvalidDuration { index: usize, duration: f64 },
    #[error("timing tolerance must be positive, got {0}ms")]
    InvalidTolerance(f64),
    #[error("grace period must be >= 0, got {0}ms")]
    InvalidGracePeriod(f64),
    #[error("passing score {0} is outside 0..=100")]
    InvalidPassingScore(f64),
    #[error("star thresholds {0:?} must be strictly ascending within 0..=100")]
    UnorderedStarThresholds([f64; 3]),
    #[error("passing score {passing} exceeds first star threshold {first}")]
    PassingAboveFirstStar { passing: f64, first: f64 },
    #[error("volume {0} is outside 0..=1")]
    InvalidVolume(f32),
    #[error("polyphony must be at least 1")]
    InvalidPolyphony,
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
