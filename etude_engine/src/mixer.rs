//! Render side of the engines: owns every sounding voice and sums them into
//! the device buffer. Fed exclusively through `RenderCommand`s so the audio
//! callback never takes a lock.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::nodes::{AdditiveVoice, Render, SamplePlayer, SynthConfig};
use crate::voice::VoiceId;

pub enum VoiceSource {
    /// Synthesised on the fly.
    Additive { pitch: u8, velocity: f32 },
    /// One-shot buffer, dropped once finished.
    Sample { data: Arc<Vec<f32>>, gain: f32 },
}

pub enum RenderCommand {
    Start { voice_id: VoiceId, source: VoiceSource },
    /// Rewind and replay a warm pooled slot. `busy` is cleared once the slot
    /// has been restarted.
    StartPooled { voice_id: VoiceId, slot: usize, gain: f32, busy: Arc<AtomicBool> },
    Release { voice_id: VoiceId },
    /// Short fade, used for eviction and re-trigger.
    Stop { voice_id: VoiceId },
    ReleaseAll,
}

pub enum RenderVoice {
    Additive(AdditiveVoice),
    Sample(SamplePlayer),
}

impl RenderVoice {
    fn next_sample(&mut self) -> f32 {
        match self {
            RenderVoice::Additive(v) => v.next_sample(),
            RenderVoice::Sample(p) => p.next_sample(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            RenderVoice::Additive(v) => v.is_finished(),
            RenderVoice::Sample(p) => !p.is_playing(),
        }
    }
}

struct PooledSlot {
    player: SamplePlayer,
    voice_id: Option<VoiceId>,
}

/// Master gain stored as f32 bits so the control side can set it lock-free.
#[derive(Clone)]
pub struct MasterGain(Arc<AtomicU32>);

impl MasterGain {
    pub fn new(gain: f32) -> Self {
        Self(Arc::new(AtomicU32::new(gain.to_bits())))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

pub struct VoiceMixer {
    commands: Receiver<RenderCommand>,
    config: SynthConfig,
    sample_rate: f32,
    voices: Vec<(VoiceId, RenderVoice)>,
    pooled: Vec<PooledSlot>,
    master_gain: MasterGain,
    drop_tx: Sender<RenderVoice>,
}

impl VoiceMixer {
    pub fn new(
        commands: Receiver<RenderCommand>,
        config: SynthConfig,
        sample_rate: f32,
        master_gain: MasterGain,
        drop_tx: Sender<RenderVoice>,
    ) -> Self {
        Self {
            commands,
            config,
            sample_rate,
            voices: Vec::with_capacity(64),
            pooled: Vec::new(),
            master_gain,
            drop_tx,
        }
    }

    /// Warm buffers addressed by `StartPooled { slot }`.
    pub fn with_pooled(mut self, buffers: Vec<Arc<Vec<f32>>>) -> Self {
        self.pooled = buffers
            .into_iter()
            .map(|data| PooledSlot { player: SamplePlayer::new(data), voice_id: None })
            .collect();
        self
    }

    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|(_, v)| !v.is_finished()).count() + self.pooled.iter().filter(|s| s.player.is_playing()).count()
    }

    fn fade_samples(&self, seconds: f32) -> usize {
        (seconds.max(0.0) * self.sample_rate) as usize
    }

    fn handle(&mut self, cmd: RenderCommand) {
        match cmd {
            RenderCommand::Start { voice_id, source } => {
                let voice = match source {
                    VoiceSource::Additive { pitch, velocity } => RenderVoice::Additive(AdditiveVoice::new(
                        voice_id,
                        pitch,
                        velocity,
                        self.sample_rate,
                        &self.config,
                    )),
                    VoiceSource::Sample { data, gain } => {
                        let mut player = SamplePlayer::new(data);
                        player.restart(gain);
                        RenderVoice::Sample(player)
                    }
                };
                self.voices.push((voice_id, voice));
            }
            RenderCommand::StartPooled { voice_id, slot, gain, busy } => {
                if let Some(slot) = self.pooled.get_mut(slot) {
                    slot.player.restart(gain);
                    slot.voice_id = Some(voice_id);
                }
                busy.store(false, Ordering::Release);
            }
            RenderCommand::Release { voice_id } => {
                let release_samples = self.fade_samples(self.config.adsr.release);
                self.end_voice(voice_id, |voice| match voice {
                    RenderVoice::Additive(v) => v.release(),
                    RenderVoice::Sample(p) => p.fade_out(release_samples),
                }, release_samples);
            }
            RenderCommand::Stop { voice_id } => {
                let fade = self.config.steal_fade;
                let fade_samples = self.fade_samples(fade);
                self.end_voice(voice_id, |voice| match voice {
                    RenderVoice::Additive(v) => v.stop(fade),
                    RenderVoice::Sample(p) => p.fade_out(fade_samples),
                }, fade_samples);
            }
            RenderCommand::ReleaseAll => {
                let release_samples = self.fade_samples(self.config.adsr.release);
                for (_, voice) in &mut self.voices {
                    match voice {
                        RenderVoice::Additive(v) => v.release(),
                        RenderVoice::Sample(p) => p.fade_out(release_samples),
                    }
                }
                for slot in &mut self.pooled {
                    if slot.voice_id.take().is_some() {
                        slot.player.fade_out(release_samples);
                    }
                }
            }
        }
    }

    fn end_voice(&mut self, voice_id: VoiceId, on_voice: impl FnOnce(&mut RenderVoice), pooled_fade: usize) {
        if let Some((_, voice)) = self.voices.iter_mut().find(|(id, _)| *id == voice_id) {
            on_voice(voice);
            return;
        }
        // Pooled slots are stopped, never unloaded.
        if let Some(slot) = self.pooled.iter_mut().find(|s| s.voice_id == Some(voice_id)) {
            slot.voice_id = None;
            slot.player.fade_out(pooled_fade);
        }
    }
}

impl Render for VoiceMixer {
    fn render(&mut self, output: &mut [f32], channels: usize) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.handle(cmd);
        }

        let channels = channels.max(1);
        let gain = self.master_gain.get();
        for frame in output.chunks_mut(channels) {
            let mut sum = 0.0;
            for (_, voice) in &mut self.voices {
                sum += voice.next_sample();
            }
            for slot in &mut self.pooled {
                sum += slot.player.next_sample();
            }
            let sample = (sum * gain).clamp(-1.0, 1.0);
            frame.fill(sample);
        }

        // Finished one-shots are freed off the audio thread. While the reaper
        // is backed up they stay in place, silent, until a later callback.
        let mut i = 0;
        while i < self.voices.len() && !self.drop_tx.is_full() {
            if self.voices[i].1.is_finished() {
                let (voice_id, voice) = self.voices.swap_remove(i);
                match self.drop_tx.try_send(voice) {
                    Ok(()) => {}
                    // No reaper thread: drop inline.
                    Err(TrySendError::Disconnected(voice)) => drop(voice),
                    Err(TrySendError::Full(voice)) => {
                        self.voices.push((voice_id, voice));
                        break;
                    }
                }
            } else {
                i += 1;
            }
        }
    }
}

/// Thread that receives finished voices and drops them.
pub fn spawn_reaper() -> Sender<RenderVoice> {
    let (drop_tx, drop_rx) = crossbeam_channel::bounded::<RenderVoice>(256);
    let spawned = std::thread::Builder::new()
        .name("etude-reaper".into())
        .spawn(move || for _ in drop_rx {});
    if let Err(e) = spawned {
        log::warn!("[Engine] Could not start reaper thread, voices drop inline: {}", e);
    }
    drop_tx
}
