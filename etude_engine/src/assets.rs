use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use crate::nodes::{render_tone, SynthConfig};
use crate::resampler::ToneResampler;

/// Seconds a pre-rendered tone is held before its release tail.
pub const RENDER_HOLD_SECONDS: f32 = 1.5;

/// Mono piano sources keyed by MIDI pitch, all at one sample rate.
#[derive(Clone, Default)]
pub struct SampleBank {
    sample_rate: u32,
    sources: BTreeMap<u8, Arc<Vec<f32>>>,
}

/// Read a WAV file and mix it down to mono f32.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), anyhow::Error> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let raw_samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = 2.0_f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    let channels = spec.channels.max(1) as usize;
    let mono = if channels == 1 {
        raw_samples
    } else {
        raw_samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((mono, spec.sample_rate))
}

impl SampleBank {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, sources: BTreeMap::new() }
    }

    /// Pre-render `pitches` through the additive voice, in parallel.
    pub fn render(pitches: RangeInclusive<u8>, sample_rate: u32, config: &SynthConfig) -> Self {
        let rendered: Vec<(u8, Vec<f32>)> = pitches
            .into_par_iter()
            .map(|pitch| (pitch, render_tone(pitch, RENDER_HOLD_SECONDS, sample_rate as f32, config)))
            .collect();
        let mut bank = Self::new(sample_rate);
        for (pitch, data) in rendered {
            bank.insert(pitch, data);
        }
        bank
    }

    /// Load every `<midi>.wav` in `dir`, converted to `sample_rate`.
    /// Files with other names are skipped.
    pub fn load_dir(dir: &Path, sample_rate: u32) -> Result<Self, anyhow::Error> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_wav = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            let pitch = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u8>().ok());
            match (is_wav, pitch) {
                (true, Some(pitch)) if pitch <= 127 => files.push((pitch, path)),
                _ => log::debug!("[Pool] Skipping {}", path.display()),
            }
        }

        let loaded: Vec<Result<(u8, Vec<f32>), anyhow::Error>> = files
            .into_par_iter()
            .map(|(pitch, path)| {
                let (data, rate) = read_wav_mono(&path)?;
                let data = ToneResampler::convert_rate(&data, rate, sample_rate)?;
                Ok((pitch, data))
            })
            .collect();

        let mut bank = Self::new(sample_rate);
        for item in loaded {
            let (pitch, data) = item?;
            bank.insert(pitch, data);
        }
        log::info!("[Pool] Loaded {} samples from {}", bank.len(), dir.display());
        Ok(bank)
    }

    pub fn insert(&mut self, pitch: u8, data: Vec<f32>) {
        self.sources.insert(pitch, Arc::new(data));
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn pitches(&self) -> impl Iterator<Item = u8> + '_ {
        self.sources.keys().copied()
    }

    pub fn get(&self, pitch: u8) -> Option<Arc<Vec<f32>>> {
        self.sources.get(&pitch).cloned()
    }

    /// Closest source pitch; the lower one wins a tie.
    pub fn nearest(&self, pitch: u8) -> Option<(u8, Arc<Vec<f32>>)> {
        self.sources
            .iter()
            .min_by_key(|(p, _)| ((**p as i16 - pitch as i16).abs(), **p))
            .map(|(p, data)| (*p, data.clone()))
    }

    /// Build `pitch` by shifting its nearest source.
    pub fn derive(&self, pitch: u8) -> Result<Vec<f32>, anyhow::Error> {
        let (source, data) = self
            .nearest(pitch)
            .ok_or_else(|| anyhow::anyhow!("sample bank is empty"))?;
        ToneResampler::pitch_shift(&data, pitch as f32 - source as f32)
    }

    /// Fill pitches of `range` missing from this bank with `other`'s.
    pub fn merge_missing(&mut self, other: SampleBank, range: RangeInclusive<u8>) {
        for (pitch, data) in other.sources {
            if range.contains(&pitch) {
                self.sources.entry(pitch).or_insert(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path, channels: u16, rate: u32, len: usize) {
        let spec = hound::WavSpec { channels, sample_rate: rate, bits_per_sample: 16, sample_format: hound::SampleFormat::Int };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..len * channels as usize {
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_nearest_prefers_lower_on_tie() {
        let mut bank = SampleBank::new(8_000);
        bank.insert(60, vec![0.0; 4]);
        bank.insert(64, vec![0.0; 4]);
        assert_eq!(bank.nearest(62).unwrap().0, 60);
        assert_eq!(bank.nearest(63).unwrap().0, 64);
        assert_eq!(bank.nearest(100).unwrap().0, 64);
        assert!(SampleBank::new(8_000).nearest(60).is_none());
    }

    #[test]
    fn test_derive_shifts_length() {
        let mut bank = SampleBank::new(8_000);
        bank.insert(60, vec![0.1; 8_000]);
        let up = bank.derive(72).unwrap();
        assert_eq!(up.len(), 4_000);
        assert!(SampleBank::new(8_000).derive(60).is_err());
    }

    #[test]
    fn test_render_covers_range() {
        let bank = SampleBank::render(60..=62, 8_000, &SynthConfig::default());
        assert_eq!(bank.pitches().collect::<Vec<_>>(), vec![60, 61, 62]);
        assert!(bank.get(61).unwrap().len() > 8_000);
    }

    #[test]
    fn test_load_dir_reads_named_wavs() {
        let dir = tempfile::tempdir().unwrap();
        write_tone(&dir.path().join("60.wav"), 2, 8_000, 800);
        write_tone(&dir.path().join("piano.wav"), 1, 8_000, 800);
        std::fs::write(dir.path().join("61.txt"), "nope").unwrap();

        let bank = SampleBank::load_dir(dir.path(), 8_000).unwrap();
        assert_eq!(bank.pitches().collect::<Vec<_>>(), vec![60]);
        let data = bank.get(60).unwrap();
        assert_eq!(data.len(), 800);
        assert!((data[10] - 0.5).abs() < 0.01);
    }
}
