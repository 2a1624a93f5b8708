use std::sync::Arc;

use etude_shared::scale::midi_to_frequency;

use crate::envelope::{AdsrParams, Envelope};
use crate::voice::VoiceId;

/// Something the output backend can pull interleaved audio from.
pub trait Render: Send + 'static {
    /// Fill `output` (interleaved, `channels` wide). Must not block.
    fn render(&mut self, output: &mut [f32], channels: usize);
}

/// Tone shaping shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthConfig {
    /// Fundamental plus this many overtones at most.
    pub harmonics: usize,
    /// Partial k is weighted 1/k^rolloff.
    pub rolloff: f32,
    pub adsr: AdsrParams,
    /// Seconds a voice sounds even if released immediately.
    pub min_sounding: f32,
    /// Fade used when a voice is stolen or re-triggered.
    pub steal_fade: f32,
    /// Per-voice headroom so a full chord does not clip.
    pub voice_gain: f32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            harmonics: 8,
            rolloff: 1.4,
            adsr: AdsrParams::default(),
            min_sounding: 0.04,
            steal_fade: 0.008,
            voice_gain: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    phase: f32,
    phase_inc: f32,
    amp: f32,
}

/// Harmonically related sine generators summed into one signal.
#[derive(Debug, Clone)]
pub struct HarmonicBank {
    partials: Vec<Partial>,
}

impl HarmonicBank {
    pub fn new(frequency: f32, sample_rate: f32, harmonics: usize, rolloff: f32) -> Self {
        let nyquist = sample_rate * 0.5;
        let mut partials = Vec::with_capacity(harmonics + 1);
        for k in 1..=(harmonics + 1) {
            let freq = frequency * k as f32;
            if freq >= nyquist {
                break;
            }
            partials.push(Partial {
                // Fundamental starts at zero phase; overtones are decorrelated.
                phase: if k == 1 { 0.0 } else { fastrand::f32() },
                phase_inc: freq / sample_rate,
                amp: 1.0 / (k as f32).powf(rolloff),
            });
        }
        let total: f32 = partials.iter().map(|p| p.amp).sum();
        if total > 0.0 {
            for p in &mut partials {
                p.amp /= total;
            }
        }
        Self { partials }
    }

    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    pub fn next_sample(&mut self) -> f32 {
        let mut sum = 0.0;
        for p in &mut self.partials {
            sum += (p.phase * std::f32::consts::TAU).sin() * p.amp;
            p.phase = (p.phase + p.phase_inc) % 1.0;
        }
        sum
    }
}

/// Oscillator voice: harmonic bank through a shared ADSR.
pub struct AdditiveVoice {
    pub id: VoiceId,
    pub pitch: u8,
    bank: HarmonicBank,
    envelope: Envelope,
    gain: f32,
}

impl AdditiveVoice {
    pub fn new(id: VoiceId, pitch: u8, velocity: f32, sample_rate: f32, config: &SynthConfig) -> Self {
        let bank = HarmonicBank::new(midi_to_frequency(pitch), sample_rate, config.harmonics, config.rolloff);
        let mut envelope = Envelope::new(config.adsr, sample_rate, config.min_sounding);
        envelope.trigger();
        Self {
            id,
            pitch,
            bank,
            envelope,
            gain: velocity.clamp(0.0, 1.0) * config.voice_gain,
        }
    }

    pub fn release(&mut self) {
        self.envelope.release();
    }

    pub fn stop(&mut self, fade: f32) {
        self.envelope.fade_out(fade);
    }

    pub fn is_finished(&self) -> bool {
        self.envelope.is_idle()
    }

    pub fn next_sample(&mut self) -> f32 {
        let env = self.envelope.next_sample();
        if env == 0.0 {
            return 0.0;
        }
        self.bank.next_sample() * env * self.gain
    }
}

/// Plays a mono buffer at the engine rate. Stopping rewinds, it never drops
/// the buffer.
pub struct SamplePlayer {
    data: Arc<Vec<f32>>,
    position: usize,
    gain: f32,
    fade_step: f32,
    fade_level: f32,
    playing: bool,
}

impl SamplePlayer {
    pub fn new(data: Arc<Vec<f32>>) -> Self {
        Self {
            data,
            position: 0,
            gain: 0.0,
            fade_step: 0.0,
            fade_level: 1.0,
            playing: false,
        }
    }

    pub fn restart(&mut self, gain: f32) {
        self.position = 0;
        self.gain = gain;
        self.fade_step = 0.0;
        self.fade_level = 1.0;
        self.playing = !self.data.is_empty();
    }

    /// Linear fade to silence over `samples`, then stop.
    pub fn fade_out(&mut self, samples: usize) {
        if !self.playing {
            return;
        }
        if samples == 0 {
            self.stop();
            return;
        }
        let step = self.fade_level / samples as f32;
        // A second fade can only shorten an ongoing one.
        self.fade_step = self.fade_step.max(step);
    }

    pub fn stop(&mut self) {
        self.playing = false;
        self.position = 0;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn next_sample(&mut self) -> f32 {
        if !self.playing {
            return 0.0;
        }
        let Some(&sample) = self.data.get(self.position) else {
            self.stop();
            return 0.0;
        };
        self.position += 1;
        let out = sample * self.gain * self.fade_level;
        if self.fade_step > 0.0 {
            self.fade_level -= self.fade_step;
            if self.fade_level <= 1.0e-6 {
                self.stop();
            }
        }
        out
    }
}

/// Offline render of one note through the additive voice, used to pre-render
/// pooled samples. The note is released after `hold` seconds and the buffer
/// ends when the envelope does.
pub fn render_tone(pitch: u8, hold: f32, sample_rate: f32, config: &SynthConfig) -> Vec<f32> {
    let mut config = *config;
    config.voice_gain = 1.0;
    let mut voice = AdditiveVoice::new(0, pitch, 1.0, sample_rate, &config);
    let hold_samples = (hold.max(0.0) * sample_rate) as usize;
    let tail_limit = ((config.adsr.release + 0.05) * sample_rate) as usize;
    let mut out = Vec::with_capacity(hold_samples + tail_limit);
    for _ in 0..hold_samples {
        out.push(voice.next_sample());
    }
    voice.release();
    while !voice.is_finished() && out.len() < hold_samples + tail_limit {
        out.push(voice.next_sample());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harmonics_above_nyquist_are_skipped() {
        // 4186 Hz fundamental at 16 kHz: only the fundamental fits under 8 kHz.
        let bank = HarmonicBank::new(4186.0, 16_000.0, 8, 1.0);
        assert_eq!(bank.partial_count(), 1);
        let bank = HarmonicBank::new(220.0, 48_000.0, 8, 1.0);
        assert_eq!(bank.partial_count(), 9);
    }

    #[test]
    fn test_bank_output_is_bounded() {
        let mut bank = HarmonicBank::new(440.0, 48_000.0, 8, 1.0);
        for _ in 0..4800 {
            assert!(bank.next_sample().abs() <= 1.0 + 1e-4);
        }
    }

    #[test]
    fn test_voice_finishes_after_release() {
        let config = SynthConfig::default();
        let mut voice = AdditiveVoice::new(1, 60, 0.8, 8_000.0, &config);
        for _ in 0..800 {
            voice.next_sample();
        }
        voice.release();
        for _ in 0..8_000 {
            voice.next_sample();
        }
        assert!(voice.is_finished());
    }

    #[test]
    fn test_sample_player_rewinds_and_fades() {
        let data = Arc::new(vec![0.5; 100]);
        let mut player = SamplePlayer::new(data);
        player.restart(1.0);
        assert_eq!(player.next_sample(), 0.5);
        player.fade_out(10);
        for _ in 0..10 {
            player.next_sample();
        }
        assert!(!player.is_playing());
        player.restart(1.0);
        assert_eq!(player.next_sample(), 0.5);
        assert_eq!(player.len(), 100);
    }

    #[test]
    fn test_render_tone_ends_silent() {
        let config = SynthConfig::default();
        let tone = render_tone(60, 0.1, 8_000.0, &config);
        assert!(tone.len() >= 800);
        assert!(tone.last().unwrap().abs() < 0.01);
    }
}
