use anyhow::Result;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::{EngineCore, EngineKind, SynthEngine};
use crate::mixer::{RenderCommand, VoiceMixer, VoiceSource};
use crate::nodes::SynthConfig;
use crate::output::AudioOutput;
use crate::voice::{EngineState, NoteHandle};

/// Additive synthesis: every note is a harmonic bank under its own ADSR,
/// rendered live on the audio thread.
pub struct OscillatorEngine {
    core: EngineCore,
}

impl OscillatorEngine {
    pub fn new(output: Box<dyn AudioOutput>, polyphony: usize, volume: f32) -> Self {
        Self::with_config(output, polyphony, volume, SynthConfig::default())
    }

    pub fn with_config(output: Box<dyn AudioOutput>, polyphony: usize, volume: f32, config: SynthConfig) -> Self {
        Self { core: EngineCore::new(output, polyphony, volume, config) }
    }
}

impl SynthEngine for OscillatorEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Oscillator
    }

    fn id(&self) -> Uuid {
        self.core.id
    }

    fn initialize(&mut self) -> Result<()> {
        if self.core.is_open() {
            return Ok(());
        }
        let config = self.core.config;
        let gain = self.core.master_gain.clone();
        self.core.open(|commands, reaper, info| {
            Ok(VoiceMixer::new(commands, config, info.sample_rate as f32, gain, reaper))
        })
    }

    fn suspend(&mut self) -> Result<()> {
        self.core.suspend()
    }

    fn resume(&mut self) -> Result<()> {
        self.core.resume()
    }

    fn dispose(&mut self) {
        self.core.dispose();
    }

    fn play_note(&mut self, pitch: u8, velocity: f32) -> NoteHandle {
        if let Err(detached) = self.core.admit(pitch) {
            return detached;
        }
        let now = self.core.now_ms();
        let alloc = self.core.voices.allocate(pitch, now);
        for voice in &alloc.stopped {
            self.core.send(RenderCommand::Stop { voice_id: voice.id });
        }
        let started = self.core.send(RenderCommand::Start {
            voice_id: alloc.voice_id,
            source: VoiceSource::Additive { pitch, velocity: velocity.clamp(0.0, 1.0) },
        });
        if !started {
            self.core.voices.release(alloc.voice_id);
            return self.core.detached(pitch);
        }
        NoteHandle::new(self.core.id, alloc.voice_id, pitch)
    }

    fn release_note(&mut self, handle: NoteHandle) {
        if let Some(voice) = self.core.take_voice(handle) {
            self.core.send(RenderCommand::Release { voice_id: voice.id });
        }
    }

    fn release_all_notes(&mut self) {
        self.core.release_all();
    }

    fn set_volume(&mut self, volume: f32) {
        self.core.master_gain.set(volume);
    }

    fn volume(&self) -> f32 {
        self.core.master_gain.get()
    }

    fn latency(&self) -> Duration {
        self.core.latency()
    }

    fn state(&self) -> EngineState {
        self.core.state
    }

    fn active_note_count(&self) -> usize {
        self.core.voices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OfflineOutput, OfflineTap};

    fn engine(polyphony: usize) -> (OscillatorEngine, OfflineTap) {
        let output = OfflineOutput::new(8_000, 1);
        let tap = output.tap();
        let mut engine = OscillatorEngine::new(Box::new(output), polyphony, 1.0);
        engine.initialize().unwrap();
        (engine, tap)
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_lifecycle_is_idempotent() {
        let (mut engine, _tap) = engine(4);
        let id = engine.id();
        engine.initialize().unwrap();
        assert!(engine.is_ready());
        engine.suspend().unwrap();
        engine.suspend().unwrap();
        assert_eq!(engine.state(), EngineState::Suspended);
        engine.resume().unwrap();
        engine.resume().unwrap();
        assert!(engine.is_ready());
        engine.dispose();
        engine.dispose();
        assert_eq!(engine.state(), EngineState::Disposed);
        assert!(engine.initialize().is_err());
        assert_eq!(engine.id(), id);
    }

    #[test]
    fn test_play_produces_sound_and_release_is_single_shot() {
        let (mut engine, tap) = engine(4);
        let handle = engine.play_note(69, 1.0);
        assert!(!handle.is_detached());
        assert!(peak(&tap.pump(800)) > 0.01);
        assert_eq!(engine.active_note_count(), 1);

        engine.release_note(handle);
        engine.release_note(handle);
        assert_eq!(engine.active_note_count(), 0);
        tap.pump(8_000);
        assert!(peak(&tap.pump(400)) < 1e-3);
    }

    #[test]
    fn test_polyphony_cap_and_retrigger() {
        let (mut engine, _tap) = engine(2);
        let first = engine.play_note(60, 0.5);
        std::thread::sleep(Duration::from_millis(2));
        engine.play_note(64, 0.5);
        std::thread::sleep(Duration::from_millis(2));
        engine.play_note(67, 0.5);
        assert_eq!(engine.active_note_count(), 2);
        // Evicted handle is stale now.
        engine.release_note(first);
        assert_eq!(engine.active_note_count(), 2);

        engine.play_note(67, 0.9);
        assert_eq!(engine.active_note_count(), 2);
    }

    #[test]
    fn test_play_before_initialize_is_detached() {
        let mut engine = OscillatorEngine::new(Box::new(OfflineOutput::new(8_000, 1)), 4, 1.0);
        let handle = engine.play_note(60, 1.0);
        assert!(handle.is_detached());
        engine.release_note(handle);
        assert_eq!(engine.active_note_count(), 0);
    }

    #[test]
    fn test_foreign_handle_is_ignored() {
        let (mut a, _ta) = engine(4);
        let (mut b, _tb) = engine(4);
        let handle = a.play_note(60, 1.0);
        b.play_note(60, 1.0);
        b.release_note(handle);
        assert_eq!(b.active_note_count(), 1);
        assert_eq!(a.active_note_count(), 1);
    }

    #[test]
    fn test_volume_is_clamped() {
        let (mut engine, _tap) = engine(4);
        engine.set_volume(3.0);
        assert_eq!(engine.volume(), 1.0);
        engine.set_volume(-1.0);
        assert_eq!(engine.volume(), 0.0);
    }
}
