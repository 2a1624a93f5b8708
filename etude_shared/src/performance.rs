use serde::{Deserialize, Serialize};

use crate::source::InputSource;

/// A note-on captured while the clock is playing.
///
/// `timestamp_ms` is latency-compensated and expressed on the session clock
/// (ms after beat 0, pauses excluded); `host_timestamp_ms` is the raw
/// observation on the host clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayedNoteEvent {
    pub pitch: u8,
    pub velocity: u8,
    pub timestamp_ms: f64,
    pub host_timestamp_ms: f64,
    pub input_source: InputSource,
    /// Filled in by the matching release, or closed out at pause/stop/completion.
    pub duration_ms: Option<f64>,
}

impl PlayedNoteEvent {
    pub fn new(pitch: u8, velocity: u8, timestamp_ms: f64, input_source: InputSource) -> Self {
        Self {
            pitch,
            velocity,
            timestamp_ms,
            host_timestamp_ms: timestamp_ms,
            input_source,
            duration_ms: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_open(&self) -> bool {
        self.duration_ms.is_none()
    }
}

/// Result of scoring one performance. Every sub-score is in 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub accuracy: f64,
    pub timing: f64,
    pub completeness: f64,
    pub duration: f64,
    pub extra_notes: f64,
    pub overall: f64,
    pub stars: u8,
    pub is_passed: bool,
    pub is_new_high_score: bool,
    pub matched_count: usize,
    pub missed_count: usize,
    pub extra_count: usize,
}
