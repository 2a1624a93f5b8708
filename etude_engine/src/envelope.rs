//! Per-voice amplitude envelope.
//!
//! Attack and decay are linear ramps; release is an exponential ramp from
//! whatever level the envelope holds at the moment of release down to a
//! near-silent floor, so a release can never jump.

/// ADSR times in seconds, sustain as a 0..1 level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: 0.005,
            decay: 0.35,
            sustain: 0.4,
            release: 0.25,
        }
    }
}

impl AdsrParams {
    pub fn new(attack: f32, decay: f32, sustain: f32, release: f32) -> Self {
        Self {
            attack: attack.max(0.0),
            decay: decay.max(0.0),
            sustain: sustain.clamp(0.0, 1.0),
            release: release.max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Attack,
    Decay,
    Sustain,
    Release,
    Idle,
}

/// Level below which a releasing voice is considered silent.
pub const RELEASE_FLOOR: f32 = 1.0e-4;

#[derive(Debug, Clone)]
pub struct Envelope {
    params: AdsrParams,
    sample_rate: f32,
    stage: EnvelopeStage,
    level: f32,
    age: u64,
    min_samples: u64,
    pending_release: Option<u64>,
    release_coef: f32,
    release_remaining: u64,
}

impl Envelope {
    /// `min_sounding` is the shortest time the voice sounds before a release
    /// is honoured.
    pub fn new(params: AdsrParams, sample_rate: f32, min_sounding: f32) -> Self {
        Self {
            params,
            sample_rate: sample_rate.max(1.0),
            stage: EnvelopeStage::Idle,
            level: 0.0,
            age: 0,
            min_samples: (min_sounding.max(0.0) * sample_rate.max(1.0)) as u64,
            pending_release: None,
            release_coef: 1.0,
            release_remaining: 0,
        }
    }

    pub fn trigger(&mut self) {
        self.stage = EnvelopeStage::Attack;
        self.age = 0;
        self.pending_release = None;
        if self.params.attack <= 0.0 {
            self.level = 1.0;
            self.stage = EnvelopeStage::Decay;
        }
    }

    /// Note-off. Deferred until the minimum sounding time has elapsed.
    pub fn release(&mut self) {
        let samples = self.seconds_to_samples(self.params.release);
        if self.age < self.min_samples {
            self.pending_release = Some(samples);
        } else {
            self.start_release(samples);
        }
    }

    /// Immediate fade used when a voice is stolen or re-triggered. Ignores the
    /// minimum sounding time.
    pub fn fade_out(&mut self, seconds: f32) {
        let samples = self.seconds_to_samples(seconds);
        let samples = if self.stage == EnvelopeStage::Release {
            samples.min(self.release_remaining)
        } else {
            samples
        };
        self.pending_release = None;
        self.start_release(samples);
    }

    fn start_release(&mut self, samples: u64) {
        if matches!(self.stage, EnvelopeStage::Idle) {
            return;
        }
        // Snapshot the current level and ramp from there.
        if self.level <= RELEASE_FLOOR || samples == 0 {
            self.level = 0.0;
            self.stage = EnvelopeStage::Idle;
            return;
        }
        self.release_coef = (RELEASE_FLOOR / self.level).powf(1.0 / samples as f32);
        self.release_remaining = samples;
        self.stage = EnvelopeStage::Release;
    }

    fn seconds_to_samples(&self, seconds: f32) -> u64 {
        (seconds.max(0.0) * self.sample_rate).round() as u64
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle
    }

    pub fn next_sample(&mut self) -> f32 {
        self.age += 1;
        if let Some(samples) = self.pending_release {
            if self.age >= self.min_samples {
                self.pending_release = None;
                self.start_release(samples);
            }
        }

        match self.stage {
            EnvelopeStage::Attack => {
                self.level += 1.0 / self.seconds_to_samples(self.params.attack).max(1) as f32;
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                let span = 1.0 - self.params.sustain;
                let step = span / self.seconds_to_samples(self.params.decay).max(1) as f32;
                self.level -= step;
                if self.level <= self.params.sustain {
                    self.level = self.params.sustain;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => {
                self.level = self.params.sustain;
            }
            EnvelopeStage::Release => {
                self.level *= self.release_coef;
                self.release_remaining = self.release_remaining.saturating_sub(1);
                if self.release_remaining == 0 || self.level <= RELEASE_FLOOR {
                    self.level = 0.0;
                    self.stage = EnvelopeStage::Idle;
                }
            }
            EnvelopeStage::Idle => {
                self.level = 0.0;
            }
        }
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 1000.0;

    fn run(env: &mut Envelope, samples: usize) -> Vec<f32> {
        (0..samples).map(|_| env.next_sample()).collect()
    }

    #[test]
    fn test_reaches_sustain() {
        let mut env = Envelope::new(AdsrParams::new(0.01, 0.02, 0.5, 0.1), SR, 0.0);
        env.trigger();
        run(&mut env, 40);
        assert_eq!(env.stage(), EnvelopeStage::Sustain);
        assert!((env.level() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_release_is_continuous() {
        let mut env = Envelope::new(AdsrParams::new(0.01, 0.02, 0.5, 0.1), SR, 0.0);
        env.trigger();
        run(&mut env, 40);
        let before = env.level();
        env.release();
        let first = env.next_sample();
        // One sample of an exponential ramp never jumps far below the snapshot.
        assert!(first <= before && first > before * 0.8);
        let tail = run(&mut env, 200);
        assert!(tail.windows(2).all(|w| w[1] <= w[0]));
        assert!(env.is_idle());
    }

    #[test]
    fn test_release_mid_attack_starts_from_current_level() {
        let mut env = Envelope::new(AdsrParams::new(0.1, 0.1, 0.5, 0.05), SR, 0.0);
        env.trigger();
        run(&mut env, 20);
        let snapshot = env.level();
        assert!(snapshot < 0.5);
        env.release();
        assert!(env.next_sample() <= snapshot);
    }

    #[test]
    fn test_minimum_sounding_duration() {
        let mut env = Envelope::new(AdsrParams::new(0.001, 0.01, 0.5, 0.01), SR, 0.05);
        env.trigger();
        env.release();
        // Held for the minimum duration, then released.
        run(&mut env, 49);
        assert_ne!(env.stage(), EnvelopeStage::Release);
        assert!(env.level() > 0.0);
        run(&mut env, 100);
        assert!(env.is_idle());
    }

    #[test]
    fn test_fade_out_ignores_minimum() {
        let mut env = Envelope::new(AdsrParams::default(), SR, 1.0);
        env.trigger();
        run(&mut env, 10);
        env.fade_out(0.005);
        run(&mut env, 10);
        assert!(env.is_idle());
    }
}
