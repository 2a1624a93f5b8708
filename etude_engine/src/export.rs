//! Bounce of an offline session to WAV, used by the headless runner.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;

use crate::output::OfflineTap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceFormat {
    Int16,
    Float32,
}

/// Accumulates everything pumped through an offline tap.
pub struct SessionBounce {
    tap: OfflineTap,
    sample_rate: u32,
    data: Vec<f32>,
}

impl SessionBounce {
    pub fn new(tap: OfflineTap, sample_rate: u32) -> Self {
        Self { tap, sample_rate, data: Vec::new() }
    }

    /// Render `frames` more frames and keep them.
    pub fn pump(&mut self, frames: usize) {
        let block = self.tap.pump(frames);
        self.data.extend_from_slice(&block);
    }

    /// Render up to `ms` of session time.
    pub fn pump_ms(&mut self, ms: f64) {
        let frames = (ms.max(0.0) / 1000.0 * self.sample_rate as f64).round() as usize;
        self.pump(frames);
    }

    pub fn frames(&self) -> usize {
        self.data.len() / self.tap.channels().max(1)
    }

    pub fn peak(&self) -> f32 {
        self.data.iter().fold(0.0f32, |max, &s| max.max(s.abs()))
    }

    pub fn samples(&self) -> &[f32] {
        &self.data
    }

    pub fn write(&self, path: &Path, format: BounceFormat) -> Result<(), anyhow::Error> {
        write_wav(path, &self.data, self.sample_rate, self.tap.channels() as u16, format)
    }
}

/// Write interleaved f32 audio, clipping to full scale.
pub fn write_wav(
    path: &Path,
    data: &[f32],
    sample_rate: u32,
    channels: u16,
    format: BounceFormat,
) -> Result<(), anyhow::Error> {
    let (bits_per_sample, sample_format) = match format {
        BounceFormat::Int16 => (16, SampleFormat::Int),
        BounceFormat::Float32 => (32, SampleFormat::Float),
    };
    let spec = WavSpec { channels: channels.max(1), sample_rate, bits_per_sample, sample_format };
    let mut writer = WavWriter::create(path, spec)?;

    match format {
        BounceFormat::Float32 => {
            for &sample in data {
                writer.write_sample(sample.clamp(-1.0, 1.0))?;
            }
        }
        BounceFormat::Int16 => {
            let scale = i16::MAX as f32;
            for &sample in data {
                writer.write_sample((sample.clamp(-1.0, 1.0) * scale).round() as i16)?;
            }
        }
    }

    writer.finalize()?;
    Ok(())
}
