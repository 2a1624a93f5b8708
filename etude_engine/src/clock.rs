//! Playback clock and session state machine.
//!
//! Every operation takes the current host time in milliseconds, so the
//! scheduler drives it with a real clock and tests drive it with numbers.
//! All control operations are idempotent.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use etude_shared::{
    ExerciseDefinition, InputSource, NoteEvent, PlayedNoteEvent, PlayerSettings, ScoreBreakdown, SourceProfile,
};

use crate::commands::ClockEvent;
use crate::engine::{with_engine, SharedEngine};
use crate::input::{InputKind, InputNormalizer, Normalized, RawInputEvent};
use crate::scoring::ScoringEngine;
use crate::transport::{BeatMap, ClockState, StatusBoard, TransportStatus, COMPLETION_GRACE_BEATS, NOTIFY_PERIOD_MS};
use crate::voice::NoteHandle;

const EVENT_QUEUE: usize = 256;

const CLICK_DOWNBEAT: u8 = 96;
const CLICK_BEAT: u8 = 89;
const CLICK_VELOCITY: f32 = 0.5;
const GUIDE_VELOCITY: f32 = 0.6;

/// Single authority on whether a tick may still run. Cleared before any
/// audio is released on pause, stop or completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn arm(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockOptions {
    pub guide_tones: bool,
    pub metronome: bool,
    pub previous_high_score: f64,
    pub notify_period_ms: f64,
}

impl Default for ClockOptions {
    fn default() -> Self {
        Self { guide_tones: false, metronome: true, previous_high_score: 0.0, notify_period_ms: NOTIFY_PERIOD_MS }
    }
}

impl ClockOptions {
    pub fn from_settings(settings: &PlayerSettings) -> Self {
        Self { guide_tones: settings.guide_tones, metronome: settings.metronome, ..Self::default() }
    }
}

pub struct PlaybackClock {
    exercise: Arc<ExerciseDefinition>,
    beat_map: BeatMap,
    last_end_beat: f64,
    required_notes: usize,
    required_pitches: [bool; 128],
    /// Accepted presses on a pitch some required note expects.
    required_played: usize,
    options: ClockOptions,
    state: ClockState,
    /// Host time at which elapsed session time was zero.
    start_time_ms: f64,
    paused_elapsed_ms: f64,
    resume_into: ClockState,
    current_beat: f64,
    last_count_in_beat: Option<u32>,
    last_notify_ms: Option<f64>,
    downbeat_reported: bool,
    loop_count: u32,
    normalizer: InputNormalizer,
    result: Option<ScoreBreakdown>,
    engine: Option<SharedEngine>,
    held: HashMap<(InputSource, u8), NoteHandle>,
    guide_started: Vec<bool>,
    guide_handles: Vec<(usize, NoteHandle)>,
    ticking: CancelToken,
    events: Sender<ClockEvent>,
    /// Lets `emit` evict the oldest notification when nobody drains.
    backlog: Receiver<ClockEvent>,
    status: StatusBoard,
    error: Option<String>,
}

impl PlaybackClock {
    pub fn new(
        exercise: Arc<ExerciseDefinition>,
        engine: Option<SharedEngine>,
        options: ClockOptions,
    ) -> (Self, Receiver<ClockEvent>) {
        let (events, events_rx) = bounded(EVENT_QUEUE);
        let mut required_pitches = [false; 128];
        for note in exercise.notes.iter().filter(|n| !n.optional) {
            if let Some(slot) = required_pitches.get_mut(note.pitch as usize) {
                *slot = true;
            }
        }
        let beat_map = BeatMap::new(exercise.ms_per_beat(), exercise.settings.count_in_beats);
        let clock = Self {
            beat_map,
            last_end_beat: exercise.last_expected_end_beat(),
            required_notes: exercise.required_note_count(),
            required_pitches,
            required_played: 0,
            guide_started: vec![false; exercise.notes.len()],
            exercise,
            options,
            state: ClockState::Idle,
            start_time_ms: 0.0,
            paused_elapsed_ms: 0.0,
            resume_into: ClockState::Playing,
            current_beat: -(beat_map.count_in_beats as f64),
            last_count_in_beat: None,
            last_notify_ms: None,
            downbeat_reported: false,
            loop_count: 0,
            normalizer: InputNormalizer::default(),
            result: None,
            engine,
            held: HashMap::new(),
            guide_handles: Vec::new(),
            ticking: CancelToken::default(),
            backlog: events_rx.clone(),
            events,
            status: StatusBoard::new(),
            error: None,
        };
        clock.publish();
        (clock, events_rx)
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn current_beat(&self) -> f64 {
        self.current_beat
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn played_notes(&self) -> &[PlayedNoteEvent] {
        self.normalizer.log()
    }

    pub fn result(&self) -> Option<ScoreBreakdown> {
        self.result
    }

    pub fn exercise(&self) -> &ExerciseDefinition {
        &self.exercise
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.ticking.clone()
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.is_armed()
    }

    pub fn source_profile(&self, source: InputSource) -> SourceProfile {
        self.normalizer.profile(source)
    }

    /// Replace a source's profile, e.g. with the latency a detector measured.
    /// Applies to compensation of later presses and to the final score.
    pub fn set_source_profile(&mut self, source: InputSource, profile: SourceProfile) {
        log::info!(
            "[Clock] {} profile: {:.1} ms compensation, x{:.2} tolerance",
            source,
            profile.latency_compensation_ms,
            profile.tolerance_multiplier
        );
        self.normalizer.set_profile(source, profile);
    }

    /// Notes sounding at `beat`.
    pub fn expected_at(&self, beat: f64) -> Vec<&NoteEvent> {
        self.exercise.notes.iter().filter(|n| n.start_beat <= beat && beat < n.end_beat()).collect()
    }

    pub fn start(&mut self, now_ms: f64) {
        if self.state != ClockState::Idle {
            return;
        }
        self.reset_session(now_ms);
        self.loop_count = 0;
        self.result = None;
        let to = self.entry_state();
        self.transition(to);
        self.ticking.arm();
        log::info!("[Clock] Started '{}' at {} BPM", self.exercise.title, self.exercise.settings.tempo_bpm);
        self.tick(now_ms);
    }

    pub fn pause(&mut self, now_ms: f64) {
        if !matches!(self.state, ClockState::CountIn | ClockState::Playing) {
            return;
        }
        self.ticking.cancel();
        self.paused_elapsed_ms = now_ms - self.start_time_ms;
        self.resume_into = self.state;
        self.close_open_notes(now_ms);
        self.release_audio();
        self.transition(ClockState::Paused);
        self.publish();
    }

    pub fn resume(&mut self, now_ms: f64) {
        if self.state != ClockState::Paused {
            return;
        }
        self.start_time_ms = now_ms - self.paused_elapsed_ms;
        self.transition(self.resume_into);
        self.ticking.arm();
        self.tick(now_ms);
    }

    /// Back to idle with all voices released. The engine stays up.
    pub fn stop(&mut self, now_ms: f64) {
        if self.state == ClockState::Idle {
            return;
        }
        self.ticking.cancel();
        if self.state == ClockState::Playing {
            self.close_open_notes(now_ms);
        }
        self.release_audio();
        self.transition(ClockState::Idle);
        self.publish();
    }

    pub fn restart(&mut self, now_ms: f64) {
        self.reset(now_ms);
        self.start(now_ms);
    }

    /// Idle with an empty log and no result. A reported error stays.
    pub fn reset(&mut self, now_ms: f64) {
        self.ticking.cancel();
        self.release_audio();
        self.reset_session(now_ms);
        self.loop_count = 0;
        self.result = None;
        self.transition(ClockState::Idle);
        self.publish();
    }

    pub fn set_volume(&mut self, volume: f32) {
        if let Some(engine) = &self.engine {
            with_engine(engine, |e| e.set_volume(volume));
        }
    }

    /// Non-fatal failure: surfaced in the status, playback continues.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[Clock] {}", message);
        self.error = Some(message.clone());
        self.emit(ClockEvent::Error(message));
        self.publish();
    }

    /// Advance to `now_ms`. Transitions are applied before this tick's
    /// notifications go out.
    pub fn tick(&mut self, now_ms: f64) {
        if !self.ticking.is_armed() || !matches!(self.state, ClockState::CountIn | ClockState::Playing) {
            return;
        }
        let elapsed = now_ms - self.start_time_ms;
        self.current_beat = self.beat_map.beat_at(elapsed);

        if self.state == ClockState::CountIn && self.current_beat >= 0.0 {
            self.transition(ClockState::Playing);
        }

        if self.state == ClockState::Playing {
            self.update_guide_tones();
            let played_enough = self.required_played >= self.required_notes;
            let done = (played_enough && self.current_beat >= self.last_end_beat)
                || self.current_beat > self.last_end_beat + COMPLETION_GRACE_BEATS;
            if done {
                if self.exercise.settings.loop_enabled {
                    self.loop_back(now_ms);
                } else {
                    self.complete(now_ms);
                    return;
                }
            }
        }

        self.announce(now_ms);
        self.publish();
    }

    /// Route an input event: monitored sources sound in any state, the log
    /// only records while playing.
    pub fn handle_input(&mut self, event: RawInputEvent) {
        if event.pitch > 127 {
            return;
        }
        let monitored = self.normalizer.profile(event.source).monitored;
        if let Some(engine) = &self.engine {
            if monitored {
                let key = (event.source, event.pitch);
                with_engine(engine, |e| match event.kind {
                    InputKind::NoteOn { velocity } => {
                        let handle = e.play_note(event.pitch, velocity as f32 / 127.0);
                        if let Some(previous) = self.held.insert(key, handle) {
                            e.release_note(previous);
                        }
                    }
                    InputKind::NoteOff => {
                        if let Some(handle) = self.held.remove(&key) {
                            e.release_note(handle);
                        }
                    }
                });
            }
        }

        if self.state != ClockState::Playing {
            return;
        }
        let session_ms = self.beat_map.session_ms(event.observed_ms - self.start_time_ms);
        match event.kind {
            InputKind::NoteOn { velocity } => {
                let outcome = self.normalizer.note_on(event.source, event.pitch, velocity, event.observed_ms, session_ms);
                if matches!(outcome, Normalized::Accepted(_)) && self.required_pitches[event.pitch as usize] {
                    self.required_played += 1;
                }
            }
            InputKind::NoteOff => {
                self.normalizer.note_off(event.source, event.pitch, session_ms);
            }
        }
    }

    fn entry_state(&self) -> ClockState {
        if self.beat_map.count_in_beats > 0 { ClockState::CountIn } else { ClockState::Playing }
    }

    fn reset_session(&mut self, now_ms: f64) {
        self.start_time_ms = now_ms;
        self.paused_elapsed_ms = 0.0;
        self.current_beat = -(self.beat_map.count_in_beats as f64);
        self.last_count_in_beat = None;
        self.last_notify_ms = None;
        self.downbeat_reported = false;
        self.normalizer.reset();
        self.required_played = 0;
        self.guide_started.iter_mut().for_each(|s| *s = false);
    }

    fn loop_back(&mut self, now_ms: f64) {
        self.release_guide_tones();
        self.reset_session(now_ms);
        self.loop_count += 1;
        log::debug!("[Clock] Loop {}", self.loop_count);
        self.emit(ClockEvent::Looped { count: self.loop_count });
        let to = self.entry_state();
        self.transition(to);
    }

    fn complete(&mut self, now_ms: f64) {
        self.ticking.cancel();
        self.close_open_notes(now_ms);
        self.release_audio();
        self.transition(ClockState::Completed);
        if self.result.is_none() {
            let scorer = ScoringEngine::new(*self.normalizer.table());
            let breakdown = scorer.score(&self.exercise, self.normalizer.log(), self.options.previous_high_score);
            log::info!(
                "[Clock] Completed: overall {:.1}, {} stars, {} matched",
                breakdown.overall,
                breakdown.stars,
                breakdown.matched_count
            );
            self.result = Some(breakdown);
            self.emit(ClockEvent::Completed(breakdown));
        }
        self.publish();
    }

    fn announce(&mut self, now_ms: f64) {
        match self.state {
            ClockState::CountIn => {
                let beat = self.beat_map.count_in_beat(now_ms - self.start_time_ms);
                if let Some(beat) = beat.filter(|b| Some(*b) != self.last_count_in_beat) {
                    self.last_count_in_beat = Some(beat);
                    let is_ready = beat == self.beat_map.count_in_beats;
                    self.emit(ClockEvent::CountIn { beat, is_ready });
                    if self.options.metronome {
                        self.click(beat == 1);
                    }
                }
            }
            ClockState::Playing if !self.downbeat_reported => {
                self.downbeat_reported = true;
                self.last_notify_ms = Some(now_ms);
                self.emit(ClockEvent::Beat { beat: self.current_beat });
                return;
            }
            _ => {}
        }
        let due = self.last_notify_ms.is_none_or(|last| now_ms - last >= self.options.notify_period_ms);
        if due {
            self.last_notify_ms = Some(now_ms);
            self.emit(ClockEvent::Beat { beat: self.current_beat });
        }
    }

    fn click(&mut self, downbeat: bool) {
        let Some(engine) = &self.engine else { return };
        let pitch = if downbeat { CLICK_DOWNBEAT } else { CLICK_BEAT };
        with_engine(engine, |e| {
            let handle = e.play_note(pitch, CLICK_VELOCITY);
            e.release_note(handle);
        });
    }

    fn update_guide_tones(&mut self) {
        if !self.options.guide_tones {
            return;
        }
        let Some(engine) = &self.engine else { return };
        let beat = self.current_beat;
        let notes = &self.exercise.notes;
        let started = &mut self.guide_started;
        let handles = &mut self.guide_handles;
        with_engine(engine, |e| {
            handles.retain(|(index, handle)| {
                let finished = beat >= notes[*index].end_beat();
                if finished {
                    e.release_note(*handle);
                }
                !finished
            });
            for (index, note) in notes.iter().enumerate() {
                if !started[index] && note.start_beat <= beat && beat < note.end_beat() {
                    started[index] = true;
                    handles.push((index, e.play_note(note.pitch, GUIDE_VELOCITY)));
                }
            }
        });
    }

    fn release_guide_tones(&mut self) {
        let handles = std::mem::take(&mut self.guide_handles);
        if let Some(engine) = &self.engine {
            with_engine(engine, |e| handles.into_iter().for_each(|(_, h)| e.release_note(h)));
        }
    }

    fn release_audio(&mut self) {
        self.release_guide_tones();
        let held: Vec<NoteHandle> = self.held.drain().map(|(_, h)| h).collect();
        if let Some(engine) = &self.engine {
            with_engine(engine, |e| {
                for handle in held {
                    e.release_note(handle);
                }
                e.release_all_notes();
            });
        }
    }

    fn close_open_notes(&mut self, now_ms: f64) {
        let session_ms = self.beat_map.session_ms(now_ms - self.start_time_ms);
        self.normalizer.close_open(session_ms);
    }

    fn transition(&mut self, to: ClockState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        log::debug!("[Clock] {:?} -> {:?}", from, to);
        self.emit(ClockEvent::StateChanged { from, to });
    }

    /// Beat updates are dropped on a full queue; anything else makes room by
    /// evicting the oldest queued notification.
    fn emit(&self, event: ClockEvent) {
        let event = match self.events.try_send(event) {
            Err(TrySendError::Full(event)) => event,
            _ => return,
        };
        if matches!(event, ClockEvent::Beat { .. }) {
            log::debug!("[Clock] Event queue full, dropped {:?}", event);
            return;
        }
        if let Ok(evicted) = self.backlog.try_recv() {
            log::debug!("[Clock] Event queue full, evicted {:?}", evicted);
        }
        if let Err(e) = self.events.try_send(event) {
            log::warn!("[Clock] Could not queue {:?}", e.into_inner());
        }
    }

    fn publish(&self) {
        let count_in_beat = match self.state {
            ClockState::CountIn => self.last_count_in_beat,
            _ => None,
        };
        self.status.publish(TransportStatus {
            state: self.state,
            is_playing: matches!(self.state, ClockState::CountIn | ClockState::Playing),
            current_beat: self.current_beat,
            count_in_beat,
            is_ready: count_in_beat.is_some_and(|b| b == self.beat_map.count_in_beats),
            has_error: self.error.is_some(),
            error_message: self.error.clone(),
            loop_count: self.loop_count,
            played_count: self.normalizer.note_on_count(),
            result: self.result,
        });
    }
}
