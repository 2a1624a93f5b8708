use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ExerciseError;
use crate::source::InputSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Oscillator engine, falling back to the pooled engine.
    #[default]
    Auto,
    Oscillator,
    Pooled,
}

/// Player-level settings supplied by the configuration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    /// Input whose adapter the host opens for a session.
    pub preferred_input: InputSource,
    pub master_volume: f32,
    /// Volume of interface feedback sounds. Carried for the presentation
    /// layer; the practice engine does not read it.
    pub ui_volume: f32,
    pub polyphony: usize,
    pub engine: EnginePreference,
    /// Play the expected notes as a reference while the exercise runs.
    pub guide_tones: bool,
    /// Click on each count-in beat.
    pub metronome: bool,
    /// Directory of `<midi>.wav` piano samples for the pooled engine.
    pub sample_dir: Option<PathBuf>,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            preferred_input: InputSource::Touch,
            master_volume: 0.8,
            ui_volume: 0.6,
            polyphony: 16,
            engine: EnginePreference::Auto,
            guide_tones: false,
            metronome: true,
            sample_dir: None,
        }
    }
}

impl PlayerSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ExerciseError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ExerciseError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ExerciseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ExerciseError> {
        for volume in [self.master_volume, self.ui_volume] {
            if !(0.0..=1.0).contains(&volume) {
                return Err(ExerciseError::InvalidVolume(volume));
            }
        }
        if self.polyphony == 0 {
            return Err(ExerciseError::InvalidPolyphony);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings = PlayerSettings::from_json_str(r#"{ "preferredInput": "mic", "engine": "pooled" }"#).unwrap();
        assert_eq!(settings.preferred_input, InputSource::Mic);
        assert_eq!(settings.engine, EnginePreference::Pooled);
        assert_eq!(settings.polyphony, 16);
        assert!(settings.metronome);
    }

    #[test]
    fn test_rejects_out_of_range_volume() {
        let err = PlayerSettings::from_json_str(r#"{ "masterVolume": 1.5 }"#).unwrap_err();
        assert!(matches!(err, ExerciseError::InvalidVolume(_)));
    }
}
