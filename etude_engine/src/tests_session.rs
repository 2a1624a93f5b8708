#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use etude_shared::{ExerciseDefinition, InputSource, NoteEvent, PlayerSettings};

    use crate::clock::{ClockOptions, PlaybackClock};
    use crate::commands::ClockEvent;
    use crate::engine::{share, with_engine, SharedEngine, SynthEngine};
    use crate::input::{InputKind, RawInputEvent};
    use crate::oscillator::OscillatorEngine;
    use crate::output::{OfflineOutput, OfflineTap};
    use crate::pooled::PooledEngine;
    use crate::transport::ClockState;
    use crate::voice::EngineState;

    const RATE: u32 = 8_000;

    fn melody() -> Arc<ExerciseDefinition> {
        let mut ex = ExerciseDefinition {
            title: "Five-finger C".into(),
            notes: [60u8, 62, 64, 65, 67]
                .iter()
                .enumerate()
                .map(|(i, p)| NoteEvent::new(*p, i as f64, 1.0))
                .collect(),
            ..Default::default()
        };
        ex.settings.tempo_bpm = 120.0;
        ex.settings.count_in_beats = 2;
        Arc::new(ex)
    }

    fn oscillator() -> (SharedEngine, OfflineTap) {
        let output = OfflineOutput::new(RATE, 1);
        let tap = output.tap();
        let mut engine = OscillatorEngine::new(Box::new(output), 8, 1.0);
        engine.initialize().unwrap();
        (share(Box::new(engine)), tap)
    }

    fn input(source: InputSource, pitch: u8, kind: InputKind, at: f64) -> RawInputEvent {
        RawInputEvent { source, pitch, kind, observed_ms: at }
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0, |m, s| m.max(s.abs()))
    }

    fn active(engine: &SharedEngine) -> usize {
        with_engine(engine, |e| e.active_note_count())
    }

    /// Plays every note on time through `source`, ticking every 16 ms.
    fn play_through(clock: &mut PlaybackClock, source: InputSource, start: f64) {
        let ex = clock.exercise().clone();
        let comp = clock.source_profile(source).latency_compensation_ms;
        let downbeat = start + ex.count_in_ms();
        let mut t = start;
        let mut pending: Vec<(f64, RawInputEvent)> = Vec::new();
        for note in &ex.notes {
            let on = downbeat + ex.expected_time_ms(note) + comp;
            let off = on + ex.expected_duration_ms(note) - 1.0;
            pending.push((on, input(source, note.pitch, InputKind::NoteOn { velocity: 100 }, on)));
            pending.push((off, input(source, note.pitch, InputKind::NoteOff, off)));
        }
        pending.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut queue = pending.into_iter().peekable();
        while clock.state() != ClockState::Completed && t < start + 20_000.0 {
            clock.tick(t);
            while let Some((_, event)) = queue.next_if(|(at, _)| *at <= t) {
                clock.handle_input(event);
            }
            t += 16.0;
        }
    }

    #[test]
    fn test_perfect_session_with_monitoring() {
        let (engine, tap) = oscillator();
        let (mut clock, events) = PlaybackClock::new(melody(), Some(engine.clone()), ClockOptions::default());
        clock.start(0.0);
        // Count-in click is audible.
        assert!(peak(&tap.pump(400)) > 1e-3);

        play_through(&mut clock, InputSource::Controller, 0.0);
        assert_eq!(clock.state(), ClockState::Completed);
        let score = clock.result().unwrap();
        assert!(score.overall >= 90.0, "{:?}", score);
        assert!(score.is_passed);
        assert_eq!(score.matched_count, 5);

        // Completion releases voices but keeps the shared engine up.
        assert_eq!(active(&engine), 0);
        assert_eq!(with_engine(&engine, |e| e.state()), EngineState::Ready);
        let completed = events.try_iter().filter(|e| matches!(e, ClockEvent::Completed(_))).count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_pause_releases_held_notes_and_closes_durations() {
        let (engine, tap) = oscillator();
        let (mut clock, _events) = PlaybackClock::new(melody(), Some(engine.clone()), ClockOptions::default());
        clock.start(0.0);
        clock.tick(1_000.0);
        assert_eq!(clock.state(), ClockState::Playing);

        clock.handle_input(input(InputSource::Touch, 60, InputKind::NoteOn { velocity: 90 }, 1_030.0));
        clock.tick(1_200.0);
        assert_eq!(active(&engine), 1);
        assert!(peak(&tap.pump(800)) > 1e-3);

        clock.pause(1_300.0);
        assert_eq!(active(&engine), 0);
        assert_eq!(clock.played_notes()[0].duration_ms, Some(300.0));
        // The release tail dies away.
        tap.pump(RATE as usize);
        assert!(peak(&tap.pump(400)) < 1e-3);

        // A late release after pause is harmless.
        clock.handle_input(input(InputSource::Touch, 60, InputKind::NoteOff, 1_400.0));
        assert_eq!(clock.played_notes()[0].duration_ms, Some(300.0));
    }

    #[test]
    fn test_mic_is_scored_but_not_monitored() {
        let (engine, _tap) = oscillator();
        let options = ClockOptions { metronome: false, ..ClockOptions::default() };
        let (mut clock, _events) = PlaybackClock::new(melody(), Some(engine.clone()), options);
        clock.start(0.0);
        clock.tick(1_000.0);
        clock.handle_input(input(InputSource::Mic, 60, InputKind::NoteOn { velocity: 90 }, 1_080.0));
        assert_eq!(active(&engine), 0);
        assert_eq!(clock.played_notes().len(), 1);
        assert_eq!(clock.played_notes()[0].timestamp_ms, 0.0);
    }

    #[test]
    fn test_guide_tones_follow_expected_notes() {
        let (engine, _tap) = oscillator();
        let options = ClockOptions { guide_tones: true, metronome: false, ..ClockOptions::default() };
        let (mut clock, _events) = PlaybackClock::new(melody(), Some(engine.clone()), options);
        clock.start(0.0);
        clock.tick(900.0);
        assert_eq!(active(&engine), 0);
        clock.tick(1_010.0);
        assert_eq!(active(&engine), 1);
        let sounding: Vec<u8> = clock.expected_at(clock.current_beat()).iter().map(|n| n.pitch).collect();
        assert_eq!(sounding, vec![60]);
        clock.tick(1_510.0);
        assert_eq!(active(&engine), 1);
        clock.stop(1_600.0);
        assert_eq!(active(&engine), 0);
    }

    #[test]
    fn test_engine_outlives_sessions() {
        let output = OfflineOutput::new(RATE, 1);
        let settings = PlayerSettings { polyphony: 4, ..PlayerSettings::default() };
        let mut pooled = PooledEngine::with_warm_range(Box::new(output), &settings, 60..=67);
        pooled.initialize().unwrap();
        let engine = share(Box::new(pooled));

        for round in 0..2 {
            let (mut clock, _events) = PlaybackClock::new(melody(), Some(engine.clone()), ClockOptions::default());
            clock.start(0.0);
            play_through(&mut clock, InputSource::Touch, 0.0);
            let score = clock.result().unwrap();
            assert!(score.is_passed, "round {}: {:?}", round, score);
            assert!(with_engine(&engine, |e| e.is_ready()));
        }
    }

    #[test]
    fn test_looping_session_never_completes() {
        let mut ex = (*melody()).clone();
        ex.settings.loop_enabled = true;
        let (mut clock, events) = PlaybackClock::new(Arc::new(ex), None, ClockOptions::default());
        clock.start(0.0);
        let mut t = 0.0;
        while t < 12_000.0 {
            clock.tick(t);
            t += 16.0;
        }
        assert_ne!(clock.state(), ClockState::Completed);
        assert!(clock.loop_count() >= 2);
        assert!(events.try_iter().all(|e| !matches!(e, ClockEvent::Completed(_))));
    }
}
