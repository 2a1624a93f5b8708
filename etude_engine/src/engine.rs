//! Synthesis engine contract, the bookkeeping both strategies share, and the
//! process-start factory that picks one.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use etude_shared::{EnginePreference, PlayerSettings};

use crate::mixer::{spawn_reaper, MasterGain, RenderCommand, RenderVoice, VoiceMixer};
use crate::nodes::SynthConfig;
use crate::oscillator::OscillatorEngine;
use crate::output::{AudioOutput, CpalOutput, OfflineOutput, OutputInfo};
use crate::pooled::PooledEngine;
use crate::voice::{ActiveVoice, EngineState, NoteHandle, VoiceTable};

/// Fixed device buffer requested by the oscillator engine.
pub const LOW_LATENCY_FRAMES: u32 = 256;

const COMMAND_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Oscillator,
    Pooled,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Oscillator => write!(f, "oscillator"),
            EngineKind::Pooled => write!(f, "pooled"),
        }
    }
}

/// Common contract of the synthesis strategies.
///
/// Lifecycle calls are idempotent. Note calls never fail: when a tone cannot
/// be produced the engine logs it and hands back a detached handle.
pub trait SynthEngine: Send {
    fn kind(&self) -> EngineKind;
    fn id(&self) -> Uuid;

    /// Open the output. A no-op once initialised.
    fn initialize(&mut self) -> Result<()>;
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    /// Release everything and close the output. Errors are swallowed.
    fn dispose(&mut self);

    /// Start `pitch` at `velocity` (0..1). Re-triggers a sounding pitch and
    /// evicts the oldest voice at the polyphony cap.
    fn play_note(&mut self, pitch: u8, velocity: f32) -> NoteHandle;
    /// No-op for stale, foreign or detached handles.
    fn release_note(&mut self, handle: NoteHandle);
    fn release_all_notes(&mut self);

    fn set_volume(&mut self, volume: f32);
    fn volume(&self) -> f32;
    fn latency(&self) -> Duration;
    fn state(&self) -> EngineState;
    fn active_note_count(&self) -> usize;

    fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }
}

/// The process-wide engine, handed to every session.
pub type SharedEngine = Arc<Mutex<Box<dyn SynthEngine>>>;

pub fn share(engine: Box<dyn SynthEngine>) -> SharedEngine {
    Arc::new(Mutex::new(engine))
}

/// Run `f` against the shared engine. A poisoned lock is recovered, since a
/// panicking caller cannot leave the voice table half-updated.
pub fn with_engine<R>(engine: &SharedEngine, f: impl FnOnce(&mut dyn SynthEngine) -> R) -> R {
    let mut guard = engine.lock().unwrap_or_else(|p| p.into_inner());
    f(guard.as_mut())
}

/// Control-side state shared by both strategies.
pub(crate) struct EngineCore {
    pub id: Uuid,
    pub state: EngineState,
    pub voices: VoiceTable,
    pub config: SynthConfig,
    pub master_gain: MasterGain,
    pub info: Option<OutputInfo>,
    output: Box<dyn AudioOutput>,
    commands: Option<Sender<RenderCommand>>,
    origin: Instant,
}

impl EngineCore {
    pub fn new(output: Box<dyn AudioOutput>, polyphony: usize, volume: f32, config: SynthConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: EngineState::Uninitialized,
            voices: VoiceTable::new(polyphony),
            config,
            master_gain: MasterGain::new(volume.clamp(0.0, 1.0)),
            info: None,
            output,
            commands: None,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }

    pub fn probe(&mut self) -> Result<OutputInfo> {
        if self.state == EngineState::Disposed {
            return Err(anyhow!("engine has been disposed"));
        }
        let info = self.output.probe()?;
        self.info = Some(info);
        Ok(info)
    }

    /// Build the mixer with `build` and hand it to the output.
    pub fn open(
        &mut self,
        build: impl FnOnce(Receiver<RenderCommand>, Sender<RenderVoice>, OutputInfo) -> Result<VoiceMixer>,
    ) -> Result<()> {
        if self.state == EngineState::Disposed {
            return Err(anyhow!("engine has been disposed"));
        }
        let info = match self.info {
            Some(info) => info,
            None => self.probe()?,
        };
        let (tx, rx) = bounded(COMMAND_QUEUE);
        let mixer = build(rx, spawn_reaper(), info)?;
        self.output.open(Box::new(mixer))?;
        self.commands = Some(tx);
        self.state = EngineState::Ready;
        log::info!(
            "[Engine] {} output ready: {} Hz, {} frames",
            self.output.name(),
            info.sample_rate,
            info.buffer_frames
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, EngineState::Ready | EngineState::Suspended)
    }

    pub fn suspend(&mut self) -> Result<()> {
        if self.state != EngineState::Ready {
            return Ok(());
        }
        self.output.pause()?;
        self.state = EngineState::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.state != EngineState::Suspended {
            return Ok(());
        }
        self.output.play()?;
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn dispose(&mut self) {
        if self.state == EngineState::Disposed {
            return;
        }
        self.release_all();
        self.output.close();
        self.commands = None;
        self.state = EngineState::Disposed;
        log::info!("[Engine] Disposed");
    }

    /// Queue a command for the render thread. `false` if it was dropped.
    pub fn send(&self, cmd: RenderCommand) -> bool {
        let Some(tx) = self.commands.as_ref() else {
            return false;
        };
        match tx.try_send(cmd) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Engine] Render command dropped: {}", e);
                false
            }
        }
    }

    pub fn commands(&self) -> Option<Sender<RenderCommand>> {
        self.commands.clone()
    }

    pub fn detached(&self, pitch: u8) -> NoteHandle {
        NoteHandle::detached(self.id, pitch)
    }

    /// Checks shared by every `play_note`. `Err` carries the detached handle.
    pub fn admit(&self, pitch: u8) -> Result<(), NoteHandle> {
        if self.state != EngineState::Ready {
            log::warn!("[Engine] play_note({}) while {:?}; note dropped", pitch, self.state);
            return Err(self.detached(pitch));
        }
        if pitch > 127 {
            log::warn!("[Engine] play_note with invalid pitch {}", pitch);
            return Err(self.detached(pitch));
        }
        Ok(())
    }

    /// Forget the voice behind `handle`. `None` when the handle is stale.
    pub fn take_voice(&mut self, handle: NoteHandle) -> Option<ActiveVoice> {
        if handle.engine_id() != self.id || handle.is_detached() {
            return None;
        }
        self.voices.release(handle.voice_id())
    }

    pub fn release_all(&mut self) -> Vec<ActiveVoice> {
        let drained = self.voices.drain();
        self.send(RenderCommand::ReleaseAll);
        drained
    }

    pub fn latency(&self) -> Duration {
        self.info.map(|i| i.buffer_latency()).unwrap_or_default()
    }
}

pub struct EngineSelection {
    pub engine: SharedEngine,
    pub kind: EngineKind,
    /// Set when only a degraded engine could be brought up.
    pub warning: Option<String>,
}

/// Initialise candidates in order and keep the first that comes up.
/// Returns the failures of the ones tried before it.
pub fn first_ready(candidates: Vec<Box<dyn SynthEngine>>) -> (Option<Box<dyn SynthEngine>>, Vec<String>) {
    let mut failures = Vec::new();
    for mut engine in candidates {
        match engine.initialize() {
            Ok(()) => return (Some(engine), failures),
            Err(e) => {
                log::warn!("[Engine] {} engine unavailable: {}", engine.kind(), e);
                failures.push(format!("{} engine: {}", engine.kind(), e));
                engine.dispose();
            }
        }
    }
    (None, failures)
}

/// Pick the engine once at process start. The oscillator engine needs a fixed
/// low-latency device buffer; without one the pooled engine takes over, and
/// without any device the pooled engine runs silent on an offline output.
pub fn create_engine(settings: &PlayerSettings) -> EngineSelection {
    let oscillator = || -> Box<dyn SynthEngine> {
        Box::new(OscillatorEngine::new(
            Box::new(CpalOutput::low_latency(LOW_LATENCY_FRAMES)),
            settings.polyphony,
            settings.master_volume,
        ))
    };
    let pooled = || -> Box<dyn SynthEngine> {
        Box::new(PooledEngine::new(Box::new(CpalOutput::device_default()), settings))
    };

    let candidates = match settings.engine {
        EnginePreference::Auto | EnginePreference::Oscillator => vec![oscillator(), pooled()],
        EnginePreference::Pooled => vec![pooled()],
    };

    let (chosen, failures) = first_ready(candidates);
    if let Some(engine) = chosen {
        let kind = engine.kind();
        log::info!("[Engine] Selected {} engine", kind);
        return EngineSelection { engine: share(engine), kind, warning: None };
    }

    let message = format!("audio output unavailable ({})", failures.join("; "));
    log::error!("[Engine] {}; continuing without sound", message);
    let mut fallback = PooledEngine::new(Box::new(OfflineOutput::new(48_000, 2)), settings);
    if let Err(e) = fallback.initialize() {
        log::warn!("[Engine] Offline fallback failed to initialise: {}", e);
    }
    EngineSelection {
        engine: share(Box::new(fallback)),
        kind: EngineKind::Pooled,
        warning: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Render;

    struct NoDevice;

    impl AudioOutput for NoDevice {
        fn name(&self) -> &'static str {
            "none"
        }
        fn probe(&mut self) -> Result<OutputInfo> {
            Err(anyhow!("no device"))
        }
        fn open(&mut self, _renderer: Box<dyn Render>) -> Result<()> {
            Err(anyhow!("no device"))
        }
        fn pause(&mut self) -> Result<()> {
            Ok(())
        }
        fn play(&mut self) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn offline_oscillator() -> Box<dyn SynthEngine> {
        Box::new(OscillatorEngine::new(Box::new(OfflineOutput::new(8_000, 1)), 4, 0.8))
    }

    #[test]
    fn test_first_ready_falls_back() {
        let broken: Box<dyn SynthEngine> = Box::new(OscillatorEngine::new(Box::new(NoDevice), 4, 0.8));
        let (chosen, failures) = first_ready(vec![broken, offline_oscillator()]);
        let chosen = chosen.unwrap();
        assert!(chosen.is_ready());
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("no device"));
    }

    #[test]
    fn test_first_ready_reports_all_failures() {
        let a: Box<dyn SynthEngine> = Box::new(OscillatorEngine::new(Box::new(NoDevice), 4, 0.8));
        let b: Box<dyn SynthEngine> = Box::new(OscillatorEngine::new(Box::new(NoDevice), 4, 0.8));
        let (chosen, failures) = first_ready(vec![a, b]);
        assert!(chosen.is_none());
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn test_shared_engine_survives_poison() {
        let engine = share(offline_oscillator());
        let cloned = engine.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison");
        })
        .join();
        let state = with_engine(&engine, |e| e.state());
        assert_eq!(state, EngineState::Uninitialized);
    }
}
