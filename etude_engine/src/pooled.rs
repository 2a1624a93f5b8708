//! Pooled playback: a warm set of pre-rendered pitches replayed from memory,
//! with everything else pitch-shifted from the nearest source on demand.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use etude_shared::PlayerSettings;

use crate::assets::SampleBank;
use crate::engine::{EngineCore, EngineKind, SynthEngine};
use crate::mixer::{RenderCommand, VoiceMixer, VoiceSource};
use crate::nodes::SynthConfig;
use crate::output::AudioOutput;
use crate::voice::{EngineState, NoteHandle, VoiceId};

/// Pitches kept warm: two octaves around middle C.
pub const WARM_PITCHES: RangeInclusive<u8> = 48..=72;

struct WarmSlot {
    index: usize,
    busy: Arc<AtomicBool>,
}

pub struct PooledEngine {
    core: EngineCore,
    warm_range: RangeInclusive<u8>,
    sample_dir: Option<PathBuf>,
    bank: Arc<SampleBank>,
    slots: HashMap<u8, WarmSlot>,
    /// Slow-path voices whose buffer is still being built.
    pending: Arc<Mutex<HashSet<VoiceId>>>,
}

impl PooledEngine {
    pub fn new(output: Box<dyn AudioOutput>, settings: &PlayerSettings) -> Self {
        Self::with_warm_range(output, settings, WARM_PITCHES)
    }

    pub fn with_warm_range(output: Box<dyn AudioOutput>, settings: &PlayerSettings, warm_range: RangeInclusive<u8>) -> Self {
        Self {
            core: EngineCore::new(output, settings.polyphony, settings.master_volume, SynthConfig::default()),
            warm_range,
            sample_dir: settings.sample_dir.clone(),
            bank: Arc::new(SampleBank::default()),
            slots: HashMap::new(),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn warm_pitches(&self) -> Vec<u8> {
        let mut pitches: Vec<u8> = self.slots.keys().copied().collect();
        pitches.sort_unstable();
        pitches
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn build_bank(&self, sample_rate: u32) -> SampleBank {
        let rendered = || SampleBank::render(self.warm_range.clone(), sample_rate, &self.core.config);
        let Some(dir) = self.sample_dir.as_ref() else {
            return rendered();
        };
        match SampleBank::load_dir(dir, sample_rate) {
            Ok(mut bank) if !bank.is_empty() => {
                // Recorded samples win; rendered tones fill warm gaps.
                if self.warm_range.clone().any(|p| bank.get(p).is_none()) {
                    bank.merge_missing(rendered(), self.warm_range.clone());
                }
                bank
            }
            Ok(_) => {
                log::warn!("[Pool] No samples in {}, using rendered tones", dir.display());
                rendered()
            }
            Err(e) => {
                log::warn!("[Pool] Could not load {}: {}; using rendered tones", dir.display(), e);
                rendered()
            }
        }
    }

    fn forget_pending(&self, voice_id: VoiceId) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&voice_id);
    }

    /// Build the voice on the rayon pool and start it once ready, unless it
    /// was released or evicted in the meantime.
    fn start_slow(&mut self, voice_id: VoiceId, pitch: u8, gain: f32) -> bool {
        let Some(commands) = self.core.commands() else {
            return false;
        };
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).insert(voice_id);

        let bank = self.bank.clone();
        let pending = self.pending.clone();
        rayon::spawn(move || {
            let data = match bank.derive(pitch) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("[Pool] Could not build pitch {}: {}", pitch, e);
                    pending.lock().unwrap_or_else(|p| p.into_inner()).remove(&voice_id);
                    return;
                }
            };
            let mut waiting = pending.lock().unwrap_or_else(|p| p.into_inner());
            if !waiting.remove(&voice_id) {
                return;
            }
            let cmd = RenderCommand::Start {
                voice_id,
                source: VoiceSource::Sample { data: Arc::new(data), gain },
            };
            if let Err(e) = commands.try_send(cmd) {
                log::warn!("[Pool] Voice for pitch {} dropped: {}", pitch, e);
            }
        });
        true
    }

    fn stop_voice(&mut self, voice_id: VoiceId) {
        self.forget_pending(voice_id);
        self.core.send(RenderCommand::Stop { voice_id });
    }
}

impl SynthEngine for PooledEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Pooled
    }

    fn id(&self) -> Uuid {
        self.core.id
    }

    fn initialize(&mut self) -> Result<()> {
        if self.core.is_open() {
            return Ok(());
        }
        let info = self.core.probe()?;
        let bank = Arc::new(self.build_bank(info.sample_rate));

        let mut warm = Vec::new();
        let mut slots = HashMap::new();
        for pitch in self.warm_range.clone() {
            if let Some(data) = bank.get(pitch) {
                slots.insert(pitch, WarmSlot { index: warm.len(), busy: Arc::new(AtomicBool::new(false)) });
                warm.push(data);
            }
        }
        log::info!("[Pool] {} warm pitches, {} sources", warm.len(), bank.len());

        let config = self.core.config;
        let gain = self.core.master_gain.clone();
        self.core.open(move |commands, reaper, info| {
            Ok(VoiceMixer::new(commands, config, info.sample_rate as f32, gain, reaper).with_pooled(warm))
        })?;
        self.bank = bank;
        self.slots = slots;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.core.suspend()
    }

    fn resume(&mut self) -> Result<()> {
        self.core.resume()
    }

    fn dispose(&mut self) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.core.dispose();
    }

    fn play_note(&mut self, pitch: u8, velocity: f32) -> NoteHandle {
        if let Err(detached) = self.core.admit(pitch) {
            return detached;
        }
        let gain = velocity.clamp(0.0, 1.0) * self.core.config.voice_gain;
        let now = self.core.now_ms();
        let alloc = self.core.voices.allocate(pitch, now);
        for voice in &alloc.stopped {
            self.stop_voice(voice.id);
        }

        // Fast path, unless the slot is still mid re-trigger.
        let warm = self
            .slots
            .get(&pitch)
            .filter(|slot| !slot.busy.swap(true, Ordering::AcqRel))
            .map(|slot| (slot.index, slot.busy.clone()));

        let started = match warm {
            Some((slot, busy)) => {
                let sent = self.core.send(RenderCommand::StartPooled {
                    voice_id: alloc.voice_id,
                    slot,
                    gain,
                    busy: busy.clone(),
                });
                if !sent {
                    busy.store(false, Ordering::Release);
                }
                sent
            }
            None => self.start_slow(alloc.voice_id, pitch, gain),
        };

        if !started {
            self.core.voices.release(alloc.voice_id);
            return self.core.detached(pitch);
        }
        NoteHandle::new(self.core.id, alloc.voice_id, pitch)
    }

    fn release_note(&mut self, handle: NoteHandle) {
        if let Some(voice) = self.core.take_voice(handle) {
            self.forget_pending(voice.id);
            self.core.send(RenderCommand::Release { voice_id: voice.id });
        }
    }

    fn release_all_notes(&mut self) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
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
    use std::time::Instant;

    fn engine(polyphony: usize) -> (PooledEngine, OfflineTap) {
        let output = OfflineOutput::new(8_000, 1);
        let tap = output.tap();
        let settings = PlayerSettings { polyphony, master_volume: 1.0, ..PlayerSettings::default() };
        let mut engine = PooledEngine::with_warm_range(Box::new(output), &settings, 60..=62);
        engine.initialize().unwrap();
        (engine, tap)
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0, |m, s| m.max(s.abs()))
    }

    /// Pump until sound appears or the deadline passes.
    fn wait_for_sound(tap: &OfflineTap) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if peak(&tap.pump(256)) > 1e-3 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_warm_pitches_are_prepared() {
        let (engine, _tap) = engine(4);
        assert_eq!(engine.warm_pitches(), vec![60, 61, 62]);
        assert!(engine.is_ready());
    }

    #[test]
    fn test_fast_path_sounds_immediately() {
        let (mut engine, tap) = engine(4);
        let handle = engine.play_note(61, 1.0);
        assert!(!handle.is_detached());
        assert!(peak(&tap.pump(800)) > 1e-3);
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_slow_path_sounds_eventually() {
        let (mut engine, tap) = engine(4);
        let handle = engine.play_note(67, 1.0);
        assert!(!handle.is_detached());
        assert!(wait_for_sound(&tap));
        engine.release_note(handle);
        assert_eq!(engine.active_note_count(), 0);
    }

    #[test]
    fn test_released_pending_voice_never_starts() {
        let (mut engine, tap) = engine(4);
        let handle = engine.play_note(80, 1.0);
        engine.release_note(handle);
        assert_eq!(engine.pending_count(), 0);
        std::thread::sleep(Duration::from_millis(200));
        assert!(peak(&tap.pump(800)) < 1e-6);
    }

    #[test]
    fn test_busy_slot_falls_back_to_slow_path() {
        let (mut engine, tap) = engine(4);
        // Re-trigger before the render thread has consumed the first start.
        engine.play_note(60, 1.0);
        engine.play_note(60, 1.0);
        assert_eq!(engine.active_note_count(), 1);
        assert!(wait_for_sound(&tap));
    }

    #[test]
    fn test_eviction_matches_oscillator_semantics() {
        let (mut engine, _tap) = engine(2);
        let first = engine.play_note(60, 1.0);
        engine.play_note(61, 1.0);
        engine.play_note(62, 1.0);
        assert_eq!(engine.active_note_count(), 2);
        engine.release_note(first);
        assert_eq!(engine.active_note_count(), 2);
        engine.release_all_notes();
        assert_eq!(engine.active_note_count(), 0);
    }
}
