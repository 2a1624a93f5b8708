use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a note event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    /// External MIDI keyboard / controller.
    Controller,
    /// Pitch detection on the microphone signal.
    Mic,
    /// On-screen keys.
    Touch,
}

impl InputSource {
    pub const ALL: [InputSource; 3] = [InputSource::Controller, InputSource::Mic, InputSource::Touch];

    pub fn index(self) -> usize {
        match self {
            InputSource::Controller => 0,
            InputSource::Mic => 1,
            InputSource::Touch => 2,
        }
    }

    pub fn profile(self) -> SourceProfile {
        SourceProfile::for_source(self)
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputSource::Controller => "controller",
            InputSource::Mic => "mic",
            InputSource::Touch => "touch",
        };
        f.write_str(name)
    }
}

/// Per-source timing characteristics, shared by input normalization and scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProfile {
    /// Subtracted from the observed timestamp.
    pub latency_compensation_ms: f64,
    /// Widens the scoring acceptance window (>= 1.0), does not shift it.
    pub tolerance_multiplier: f64,
    /// Whether presses from this source are echoed through the synthesizer.
    pub monitored: bool,
}

const PROFILES: [SourceProfile; 3] = [
    // Controller: direct digital event
    SourceProfile { latency_compensation_ms: 5.0, tolerance_multiplier: 1.0, monitored: true },
    // Mic: analysis window + detector hold frames, jittery
    SourceProfile { latency_compensation_ms: 80.0, tolerance_multiplier: 1.5, monitored: false },
    // Touch: compositor + touch digitizer delay
    SourceProfile { latency_compensation_ms: 30.0, tolerance_multiplier: 1.0, monitored: true },
];

impl SourceProfile {
    pub fn for_source(source: InputSource) -> Self {
        PROFILES[source.index()]
    }
}

/// Lookup table keyed by source. Starts from the built-in profiles; a
/// detector that measures its own delay can override its entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceTable {
    profiles: [SourceProfile; 3],
}

impl Default for SourceTable {
    fn default() -> Self {
        Self { profiles: PROFILES }
    }
}

impl SourceTable {
    pub fn get(&self, source: InputSource) -> SourceProfile {
        self.profiles[source.index()]
    }

    pub fn set(&mut self, source: InputSource, profile: SourceProfile) {
        let mut profile = profile;
        if !profile.latency_compensation_ms.is_finite() || profile.latency_compensation_ms < 0.0 {
            profile.latency_compensation_ms = 0.0;
        }
        if !profile.tolerance_multiplier.is_finite() || profile.tolerance_multiplier < 1.0 {
            profile.tolerance_multiplier = 1.0;
        }
        self.profiles[source.index()] = profile;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mic_has_widest_window_and_largest_delay() {
        let mic = InputSource::Mic.profile();
        for source in [InputSource::Controller, InputSource::Touch] {
            let other = source.profile();
            assert!(mic.latency_compensation_ms > other.latency_compensation_ms);
            assert!(mic.tolerance_multiplier > other.tolerance_multiplier);
        }
        assert!(!mic.monitored);
    }

    #[test]
    fn test_table_override_is_sanitised() {
        let mut table = SourceTable::default();
        table.set(
            InputSource::Mic,
            SourceProfile { latency_compensation_ms: -3.0, tolerance_multiplier: 0.5, monitored: false },
        );
        let mic = table.get(InputSource::Mic);
        assert_eq!(mic.latency_compensation_ms, 0.0);
        assert_eq!(mic.tolerance_multiplier, 1.0);
        assert_eq!(table.get(InputSource::Touch), InputSource::Touch.profile());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&InputSource::Touch).unwrap(), "\"touch\"");
        let parsed: InputSource = serde_json::from_str("\"controller\"").unwrap();
        assert_eq!(parsed, InputSource::Controller);
    }
}
