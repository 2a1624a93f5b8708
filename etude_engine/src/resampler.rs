use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

pub struct ToneResampler;

impl ToneResampler {
    /// Shift a mono buffer by `semitones` by playing it faster or slower.
    /// Upward shifts shorten the buffer.
    pub fn pitch_shift(input: &[f32], semitones: f32) -> Result<Vec<f32>, anyhow::Error> {
        if semitones == 0.0 {
            return Ok(input.to_vec());
        }
        let speed = 2.0_f64.powf(semitones as f64 / 12.0);
        Self::resample(input, 1.0 / speed)
    }

    /// Convert a mono buffer between sample rates.
    pub fn convert_rate(input: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>, anyhow::Error> {
        if from_hz == 0 || to_hz == 0 {
            return Err(anyhow::anyhow!("sample rates must be positive"));
        }
        if from_hz == to_hz {
            return Ok(input.to_vec());
        }
        Self::resample(input, to_hz as f64 / from_hz as f64)
    }

    /// Sinc resampling with `output_ratio` output samples per input sample.
    pub fn resample(input: &[f32], output_ratio: f64) -> Result<Vec<f32>, anyhow::Error> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        if !(output_ratio.is_finite() && output_ratio > 0.0) {
            return Err(anyhow::anyhow!("Ratio must be positive"));
        }

        let chunk_size = 1024;
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(output_ratio, 1.0, params, chunk_size, 1)?;

        let expected_len = (input.len() as f64 * output_ratio).round() as usize;
        let mut output = Vec::with_capacity(expected_len + chunk_size);
        let mut input_pos = 0;

        // One extra zero chunk flushes the filter tail.
        while input_pos < input.len() + chunk_size && output.len() < expected_len {
            let end = (input_pos + chunk_size).min(input.len());
            let mut chunk = if input_pos < input.len() { input[input_pos..end].to_vec() } else { Vec::new() };
            chunk.resize(chunk_size, 0.0);

            let out_waves = resampler.process(&[chunk], None)?;
            if let Some(chan_out) = out_waves.first() {
                output.extend_from_slice(chan_out);
            }
            input_pos += chunk_size;
        }

        output.truncate(expected_len);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * freq / sample_rate * std::f32::consts::TAU).sin())
            .collect()
    }

    /// Crude frequency estimate from upward zero crossings.
    fn crossings(data: &[f32]) -> usize {
        data.windows(2).filter(|w| w[0] < 0.0 && w[1] >= 0.0).count()
    }

    #[test]
    fn test_octave_up_halves_length() {
        let input = sine(220.0, 8_000.0, 8_000);
        let out = ToneResampler::pitch_shift(&input, 12.0).unwrap();
        assert_eq!(out.len(), 4_000);
        // Same number of cycles squeezed into half the samples.
        let ratio = crossings(&out) as f32 / crossings(&input) as f32;
        assert!((ratio - 1.0).abs() < 0.05, "ratio {}", ratio);
    }

    #[test]
    fn test_convert_rate_length() {
        let input = vec![0.0; 44_100];
        let out = ToneResampler::convert_rate(&input, 44_100, 48_000).unwrap();
        assert_eq!(out.len(), 48_000);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        assert!(ToneResampler::resample(&[0.0; 10], 0.0).is_err());
        assert!(ToneResampler::resample(&[], 2.0).unwrap().is_empty());
    }
}
