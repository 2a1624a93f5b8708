//! Microphone input: device capture into a ring buffer, drained by an
//! analysis thread that runs a pitch tracker and emits note events.

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use etude_shared::scale::frequency_to_midi;
use etude_shared::{InputSource, SourceProfile};

use crate::input::InputSender;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchTrackerConfig {
    pub window: usize,
    pub hop: usize,
    pub min_hz: f32,
    pub max_hz: f32,
    /// Minimum normalized correlation of the chosen period.
    pub clarity: f32,
    /// Frames quieter than this RMS count as silence.
    pub rms_gate: f32,
    /// Consecutive frames a new pitch must hold before its note-on.
    pub onset_frames: u32,
    /// Consecutive silent frames before a note-off.
    pub release_frames: u32,
}

impl Default for PitchTrackerConfig {
    fn default() -> Self {
        Self {
            window: 2048,
            hop: 512,
            min_hz: 60.0,
            max_hz: 1200.0,
            clarity: 0.8,
            rms_gate: 0.01,
            onset_frames: 2,
            release_frames: 3,
        }
    }
}

impl PitchTrackerConfig {
    /// Delay from a note's onset to its note-on: half a window until the new
    /// pitch dominates, then the onset hold.
    pub fn detection_latency_ms(&self, sample_rate: u32) -> f64 {
        let samples = self.window / 2 + self.onset_frames as usize * self.hop;
        samples as f64 * 1000.0 / sample_rate.max(1) as f64
    }

    /// Mic profile with compensation measured from this configuration.
    pub fn source_profile(&self, sample_rate: u32) -> SourceProfile {
        SourceProfile {
            latency_compensation_ms: self.detection_latency_ms(sample_rate),
            ..InputSource::Mic.profile()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitchEvent {
    NoteOn { pitch: u8, velocity: u8 },
    NoteOff { pitch: u8 },
}

/// Monophonic pitch tracker over the normalized square difference function.
pub struct PitchTracker {
    config: PitchTrackerConfig,
    sample_rate: f32,
    buffer: Vec<f32>,
    nsdf: Vec<f32>,
    candidate: Option<(u8, u32)>,
    current: Option<u8>,
    silent_frames: u32,
}

impl PitchTracker {
    pub fn new(config: PitchTrackerConfig, sample_rate: f32) -> Self {
        let config = PitchTrackerConfig { hop: config.hop.clamp(1, config.window.max(1)), ..config };
        Self {
            config,
            sample_rate,
            buffer: Vec::with_capacity(config.window * 2),
            nsdf: Vec::with_capacity(config.window),
            candidate: None,
            current: None,
            silent_frames: 0,
        }
    }

    pub fn current(&self) -> Option<u8> {
        self.current
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<PitchEvent> {
        let mut events = Vec::new();
        self.buffer.extend_from_slice(samples);
        while self.buffer.len() >= self.config.window {
            let detected = self.detect();
            self.buffer.drain(..self.config.hop);
            self.advance(detected, &mut events);
        }
        events
    }

    /// Release the held note, if any.
    pub fn flush(&mut self) -> Option<PitchEvent> {
        self.candidate = None;
        self.silent_frames = 0;
        self.current.take().map(|pitch| PitchEvent::NoteOff { pitch })
    }

    fn detect(&mut self) -> Option<(u8, f32)> {
        let frame = &self.buffer[..self.config.window];
        let rms = (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt();
        if rms < self.config.rms_gate {
            return None;
        }

        let min_lag = ((self.sample_rate / self.config.max_hz).floor() as usize).max(2);
        let max_lag = ((self.sample_rate / self.config.min_hz).ceil() as usize).min(frame.len() / 2);
        if min_lag + 2 >= max_lag {
            return None;
        }

        self.nsdf.clear();
        for lag in 0..=max_lag + 1 {
            let mut acf = 0.0;
            let mut energy = 0.0;
            for i in 0..frame.len() - lag {
                acf += frame[i] * frame[i + lag];
                energy += frame[i] * frame[i] + frame[i + lag] * frame[i + lag];
            }
            self.nsdf.push(if energy > 0.0 { 2.0 * acf / energy } else { 0.0 });
        }

        let peak = self.nsdf[min_lag..=max_lag].iter().cloned().fold(f32::MIN, f32::max);
        if peak < self.config.clarity {
            return None;
        }
        // First local maximum close to the best one avoids octave-down errors.
        let threshold = peak * 0.9;
        let lag = (min_lag..=max_lag).find(|&l| {
            let v = self.nsdf[l];
            v >= threshold && v >= self.nsdf[l - 1] && v >= self.nsdf[l + 1]
        })?;

        let (a, b, c) = (self.nsdf[lag - 1], self.nsdf[lag], self.nsdf[lag + 1]);
        let denom = a - 2.0 * b + c;
        let shift = if denom.abs() > f32::EPSILON { 0.5 * (a - c) / denom } else { 0.0 };
        let period = lag as f32 + shift.clamp(-0.5, 0.5);

        let (pitch, _cents) = frequency_to_midi(self.sample_rate / period)?;
        Some((pitch, rms))
    }

    fn advance(&mut self, detected: Option<(u8, f32)>, events: &mut Vec<PitchEvent>) {
        match detected {
            Some((pitch, _)) if Some(pitch) == self.current => {
                self.candidate = None;
                self.silent_frames = 0;
            }
            Some((pitch, rms)) => {
                let count = match self.candidate {
                    Some((p, n)) if p == pitch => n + 1,
                    _ => 1,
                };
                self.candidate = Some((pitch, count));
                if count >= self.config.onset_frames {
                    if let Some(prev) = self.current.take() {
                        events.push(PitchEvent::NoteOff { pitch: prev });
                    }
                    let velocity = ((rms * 4.0).clamp(0.0, 1.0) * 127.0).round().max(1.0) as u8;
                    events.push(PitchEvent::NoteOn { pitch, velocity });
                    self.current = Some(pitch);
                    self.candidate = None;
                    self.silent_frames = 0;
                }
            }
            None => {
                self.candidate = None;
                if self.current.is_some() {
                    self.silent_frames += 1;
                    if self.silent_frames >= self.config.release_frames {
                        if let Some(event) = self.flush() {
                            events.push(event);
                        }
                    }
                }
            }
        }
    }
}

/// Live microphone capture feeding an `InputSender`.
pub struct MicCapture {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    profile: SourceProfile,
}

impl MicCapture {
    pub fn start(sender: InputSender, config: PitchTrackerConfig) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);

        let thread = thread::Builder::new().name("etude-mic".into()).spawn(move || {
            let opened = open_input();
            let (stream, mut consumer, sample_rate, channels) = match opened {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(sample_rate));

            let mut tracker = PitchTracker::new(config, sample_rate as f32);
            let mut interleaved = vec![0.0f32; 4096];
            let mut mono = Vec::with_capacity(4096);
            while running_thread.load(Ordering::Acquire) {
                loop {
                    let n = consumer.pop_slice(&mut interleaved);
                    if n == 0 {
                        break;
                    }
                    mono.clear();
                    mono.extend(interleaved[..n].chunks(channels).map(|f| f.iter().sum::<f32>() / f.len() as f32));
                    for event in tracker.push(&mono) {
                        forward(&sender, event);
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }
            if let Some(event) = tracker.flush() {
                forward(&sender, event);
            }
            drop(stream);
        })?;

        let sample_rate = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow!("microphone thread did not report readiness"))??;
        let profile = config.source_profile(sample_rate);
        log::info!("[Mic] Capturing at {} Hz, {:.1} ms detection delay", sample_rate, profile.latency_compensation_ms);
        Ok(Self { running, thread: Some(thread), sample_rate, profile })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Timing profile to hand to the clock for this capture.
    pub fn profile(&self) -> SourceProfile {
        self.profile
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("[Mic] Analysis thread panicked");
            }
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward(sender: &InputSender, event: PitchEvent) {
    match event {
        PitchEvent::NoteOn { pitch, velocity } => sender.note_on(InputSource::Mic, pitch, velocity),
        PitchEvent::NoteOff { pitch } => sender.note_off(InputSource::Mic, pitch),
    };
}

fn open_input() -> Result<(cpal::Stream, ringbuf::HeapCons<f32>, u32, usize)> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(anyhow!("No input device available"))?;
    let config = device.default_input_config()?;
    if config.sample_format() != cpal::SampleFormat::F32 {
        return Err(anyhow!("Unsupported input sample format {:?}", config.sample_format()));
    }
    let sample_rate = config.sample_rate();
    let channels = (config.channels() as usize).max(1);

    // One second of headroom.
    let rb = HeapRb::<f32>::new(sample_rate as usize * channels);
    let (mut producer, consumer) = rb.split();

    let stream = device.build_input_stream(
        &config.into(),
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            producer.push_slice(data);
        },
        |err| log::warn!("[Mic] Stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok((stream, consumer, sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f32 = 8_000.0;

    fn config() -> PitchTrackerConfig {
        PitchTrackerConfig { window: 512, hop: 256, ..PitchTrackerConfig::default() }
    }

    fn tone(freq: f32, len: usize, amp: f32) -> Vec<f32> {
        (0..len).map(|i| amp * (i as f32 * freq / RATE * std::f32::consts::TAU).sin()).collect()
    }

    #[test]
    fn test_profile_reports_detection_delay() {
        let profile = config().source_profile(RATE as u32);
        // 256 samples of half window plus two 256-sample hops.
        assert_eq!(profile.latency_compensation_ms, 96.0);
        assert_eq!(profile.tolerance_multiplier, InputSource::Mic.profile().tolerance_multiplier);
        assert!(!profile.monitored);
    }

    #[test]
    fn test_detects_a440_then_releases_on_silence() {
        let mut tracker = PitchTracker::new(config(), RATE);
        let events = tracker.push(&tone(440.0, 4_000, 0.5));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PitchEvent::NoteOn { pitch: 69, .. }));

        let events = tracker.push(&vec![0.0; 4_000]);
        assert_eq!(events, vec![PitchEvent::NoteOff { pitch: 69 }]);
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn test_pitch_change_closes_previous_note() {
        let mut tracker = PitchTracker::new(config(), RATE);
        tracker.push(&tone(261.63, 4_000, 0.5));
        assert_eq!(tracker.current(), Some(60));
        let events = tracker.push(&tone(392.0, 4_000, 0.5));
        assert_eq!(events[0], PitchEvent::NoteOff { pitch: 60 });
        assert!(matches!(events[1], PitchEvent::NoteOn { pitch: 67, .. }));
    }

    #[test]
    fn test_quiet_and_noisy_input_is_ignored() {
        let mut tracker = PitchTracker::new(config(), RATE);
        assert!(tracker.push(&tone(440.0, 4_000, 0.001)).is_empty());
        let mut rng = fastrand::Rng::with_seed(7);
        let noise: Vec<f32> = (0..4_000).map(|_| rng.f32() * 2.0 - 1.0).collect();
        assert!(tracker.push(&noise).is_empty());
    }

    #[test]
    fn test_flush_releases_held_note() {
        let mut tracker = PitchTracker::new(config(), RATE);
        tracker.push(&tone(440.0, 4_000, 0.5));
        assert_eq!(tracker.flush(), Some(PitchEvent::NoteOff { pitch: 69 }));
        assert_eq!(tracker.flush(), None);
    }
}
