//! Input normalization: every adapter (controller, mic, touch) pushes raw
//! note events into one bounded channel; the `InputNormalizer` turns them
//! into the played-note log on the session clock.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::time::Instant;

use etude_shared::{InputSource, PlayedNoteEvent, SourceProfile, SourceTable};

/// A note-on of a pitch already accepted from another source within this
/// window is treated as an echo of the same key press.
pub const DEDUP_WINDOW_MS: f64 = 40.0;

pub const INPUT_QUEUE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    NoteOn { velocity: u8 },
    NoteOff,
}

/// Event as observed by an adapter, stamped on the host clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawInputEvent {
    pub source: InputSource,
    pub pitch: u8,
    pub kind: InputKind,
    pub observed_ms: f64,
}

/// Monotonic host clock shared by adapters and the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Producer side handed to adapters. Never blocks: a full queue drops the
/// event with a warning.
#[derive(Clone)]
pub struct InputSender {
    tx: Sender<RawInputEvent>,
    clock: HostClock,
}

pub fn input_channel(capacity: usize, clock: HostClock) -> (InputSender, Receiver<RawInputEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    (InputSender { tx, clock }, rx)
}

impl InputSender {
    pub fn clock(&self) -> HostClock {
        self.clock
    }

    pub fn send(&self, event: RawInputEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(e)) => {
                log::warn!("[Input] Queue full, dropped {:?} from {}", e.kind, e.source);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn note_on(&self, source: InputSource, pitch: u8, velocity: u8) -> bool {
        self.send(RawInputEvent {
            source,
            pitch,
            kind: InputKind::NoteOn { velocity },
            observed_ms: self.clock.now_ms(),
        })
    }

    pub fn note_off(&self, source: InputSource, pitch: u8) -> bool {
        self.send(RawInputEvent { source, pitch, kind: InputKind::NoteOff, observed_ms: self.clock.now_ms() })
    }
}

/// On-screen keys: presses go straight into the queue.
#[derive(Clone)]
pub struct TouchKeys {
    sender: InputSender,
}

impl TouchKeys {
    pub fn new(sender: InputSender) -> Self {
        Self { sender }
    }

    pub fn press(&self, pitch: u8, velocity: u8) -> bool {
        self.sender.note_on(InputSource::Touch, pitch, velocity)
    }

    pub fn release(&self, pitch: u8) -> bool {
        self.sender.note_off(InputSource::Touch, pitch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalized {
    /// Appended to the log at this index.
    Accepted(usize),
    /// Paired with the note-on at this index.
    Closed { index: usize, duration_ms: f64 },
    /// Duplicate of a press already accepted from another source.
    Echo,
    /// Note-off with no open note-on of that pitch.
    Unmatched,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
struct LastAccepted {
    source: InputSource,
    at_ms: f64,
}

pub struct InputNormalizer {
    table: SourceTable,
    log: Vec<PlayedNoteEvent>,
    /// Per pitch, log indices of notes still held, most recent last.
    open: Vec<Vec<usize>>,
    last_timestamp: [Option<f64>; 3],
    last_accepted: Vec<Option<LastAccepted>>,
    /// Note-offs still owed by suppressed echoes.
    echoes: HashMap<(InputSource, u8), u32>,
}

impl Default for InputNormalizer {
    fn default() -> Self {
        Self::new(SourceTable::default())
    }
}

impl InputNormalizer {
    pub fn new(table: SourceTable) -> Self {
        Self {
            table,
            log: Vec::with_capacity(256),
            open: vec![Vec::new(); 128],
            last_timestamp: [None; 3],
            last_accepted: vec![None; 128],
            echoes: HashMap::new(),
        }
    }

    pub fn profile(&self, source: InputSource) -> SourceProfile {
        self.table.get(source)
    }

    pub fn set_profile(&mut self, source: InputSource, profile: SourceProfile) {
        self.table.set(source, profile);
    }

    pub fn table(&self) -> &SourceTable {
        &self.table
    }

    /// Record a press. `session_ms` is the observation on the session clock;
    /// the logged timestamp has the source's compensation removed and never
    /// runs backwards for a source.
    pub fn note_on(&mut self, source: InputSource, pitch: u8, velocity: u8, host_ms: f64, session_ms: f64) -> Normalized {
        if pitch > 127 || !session_ms.is_finite() {
            return Normalized::Invalid;
        }
        let compensated = session_ms - self.table.get(source).latency_compensation_ms;

        if let Some(last) = self.last_accepted[pitch as usize] {
            if last.source != source && (compensated - last.at_ms).abs() <= DEDUP_WINDOW_MS {
                *self.echoes.entry((source, pitch)).or_insert(0) += 1;
                log::debug!("[Input] Dropped {} echo of pitch {} from {}", source, pitch, last.source);
                return Normalized::Echo;
            }
        }

        let slot = &mut self.last_timestamp[source.index()];
        let timestamp = match *slot {
            Some(prev) if compensated < prev => prev,
            _ => compensated,
        };
        *slot = Some(timestamp);
        self.last_accepted[pitch as usize] = Some(LastAccepted { source, at_ms: compensated });

        let index = self.log.len();
        self.log.push(PlayedNoteEvent {
            pitch,
            velocity: velocity.min(127),
            timestamp_ms: timestamp,
            host_timestamp_ms: host_ms,
            input_source: source,
            duration_ms: None,
        });
        self.open[pitch as usize].push(index);
        Normalized::Accepted(index)
    }

    /// Pair a release with the most recent open press of the pitch, preferring
    /// one from the same source.
    pub fn note_off(&mut self, source: InputSource, pitch: u8, session_ms: f64) -> Normalized {
        if pitch > 127 {
            return Normalized::Invalid;
        }
        if let Some(owed) = self.echoes.get_mut(&(source, pitch)) {
            *owed -= 1;
            if *owed == 0 {
                self.echoes.remove(&(source, pitch));
            }
            return Normalized::Echo;
        }

        let stack = &mut self.open[pitch as usize];
        let pos = stack
            .iter()
            .rposition(|&i| self.log[i].input_source == source)
            .or_else(|| stack.len().checked_sub(1));
        let Some(pos) = pos else {
            return Normalized::Unmatched;
        };
        let index = stack.remove(pos);

        let released_at = session_ms - self.table.get(source).latency_compensation_ms;
        let event = &mut self.log[index];
        let duration_ms = (released_at - event.timestamp_ms).max(0.0);
        event.duration_ms = Some(duration_ms);
        Normalized::Closed { index, duration_ms }
    }

    /// Close every held note at `session_ms`. Returns how many were closed.
    pub fn close_open(&mut self, session_ms: f64) -> usize {
        let mut closed = 0;
        for stack in &mut self.open {
            for index in stack.drain(..) {
                let event = &mut self.log[index];
                event.duration_ms = Some((session_ms - event.timestamp_ms).max(0.0));
                closed += 1;
            }
        }
        closed
    }

    pub fn reset(&mut self) {
        self.log.clear();
        for stack in &mut self.open {
            stack.clear();
        }
        self.last_timestamp = [None; 3];
        self.last_accepted.iter_mut().for_each(|l| *l = None);
        self.echoes.clear();
    }

    pub fn log(&self) -> &[PlayedNoteEvent] {
        &self.log
    }

    pub fn note_on_count(&self) -> usize {
        self.log.len()
    }

    pub fn open_count(&self) -> usize {
        self.open.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compensation_is_per_source() {
        let mut n = InputNormalizer::default();
        n.note_on(InputSource::Controller, 60, 100, 1000.0, 500.0);
        n.note_on(InputSource::Mic, 62, 100, 1000.0, 500.0);
        n.note_on(InputSource::Touch, 64, 100, 1000.0, 500.0);
        let ts: Vec<f64> = n.log().iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(ts, vec![495.0, 420.0, 470.0]);
        assert!(n.log().iter().all(|e| e.host_timestamp_ms == 1000.0));
    }

    #[test]
    fn test_rapid_repeats_pair_lifo() {
        let mut n = InputNormalizer::default();
        n.note_on(InputSource::Controller, 60, 90, 0.0, 100.0);
        n.note_on(InputSource::Controller, 60, 90, 0.0, 200.0);
        assert_eq!(
            n.note_off(InputSource::Controller, 60, 250.0),
            Normalized::Closed { index: 1, duration_ms: 50.0 }
        );
        assert_eq!(
            n.note_off(InputSource::Controller, 60, 400.0),
            Normalized::Closed { index: 0, duration_ms: 300.0 }
        );
        assert_eq!(n.note_off(InputSource::Controller, 60, 500.0), Normalized::Unmatched);
    }

    #[test]
    fn test_release_prefers_same_source() {
        let mut n = InputNormalizer::default();
        n.note_on(InputSource::Controller, 60, 90, 0.0, 100.0);
        n.note_on(InputSource::Touch, 60, 90, 0.0, 400.0);
        match n.note_off(InputSource::Controller, 60, 600.0) {
            Normalized::Closed { index, .. } => assert_eq!(index, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(n.open_count(), 1);
    }

    #[test]
    fn test_timestamps_never_run_backwards_per_source() {
        let mut n = InputNormalizer::default();
        n.note_on(InputSource::Mic, 60, 90, 0.0, 300.0);
        n.note_on(InputSource::Mic, 62, 90, 0.0, 250.0);
        let ts: Vec<f64> = n.log().iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(ts, vec![220.0, 220.0]);
    }

    #[test]
    fn test_cross_source_echo_is_dropped_with_its_release() {
        let mut n = InputNormalizer::default();
        // Same key seen by the controller and, 25 ms later, the touch layer.
        assert_eq!(n.note_on(InputSource::Controller, 60, 90, 0.0, 105.0), Normalized::Accepted(0));
        assert_eq!(n.note_on(InputSource::Touch, 60, 90, 0.0, 150.0), Normalized::Echo);
        assert_eq!(n.note_off(InputSource::Touch, 60, 300.0), Normalized::Echo);
        assert_eq!(n.open_count(), 1);
        // Later press from touch is real.
        assert!(matches!(n.note_on(InputSource::Touch, 60, 90, 0.0, 900.0), Normalized::Accepted(1)));
    }

    #[test]
    fn test_close_open_fills_durations() {
        let mut n = InputNormalizer::default();
        n.note_on(InputSource::Controller, 60, 90, 0.0, 100.0);
        n.note_on(InputSource::Controller, 64, 90, 0.0, 200.0);
        n.note_off(InputSource::Controller, 64, 305.0);
        assert_eq!(n.close_open(1095.0), 1);
        assert!(n.log().iter().all(|e| !e.is_open()));
        assert_eq!(n.log()[0].duration_ms, Some(1000.0));
        assert_eq!(n.close_open(2000.0), 0);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (tx, rx) = input_channel(1, HostClock::new());
        let keys = TouchKeys::new(tx);
        assert!(keys.press(60, 100));
        assert!(!keys.release(60));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, InputKind::NoteOn { velocity: 100 });
        assert_eq!(event.source, InputSource::Touch);
    }
}
