//! Control-side voice bookkeeping shared by every synthesis engine: handle
//! tagging, polyphony eviction and same-pitch re-trigger.

use uuid::Uuid;

pub type VoiceId = u64;

/// Id never handed out to a real voice.
const DETACHED: VoiceId = 0;

/// Capability for one sounding note. Valid from `play_note` until the first
/// matching release, eviction or bulk release; afterwards releasing it is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoteHandle {
    engine_id: Uuid,
    voice_id: VoiceId,
    pitch: u8,
}

impl NoteHandle {
    pub(crate) fn new(engine_id: Uuid, voice_id: VoiceId, pitch: u8) -> Self {
        Self { engine_id, voice_id, pitch }
    }

    /// Handle returned when playback failed. Releasing it does nothing.
    pub(crate) fn detached(engine_id: Uuid, pitch: u8) -> Self {
        Self { engine_id, voice_id: DETACHED, pitch }
    }

    pub fn is_detached(&self) -> bool {
        self.voice_id == DETACHED
    }

    pub fn engine_id(&self) -> Uuid {
        self.engine_id
    }

    pub fn voice_id(&self) -> VoiceId {
        self.voice_id
    }

    pub fn pitch(&self) -> u8 {
        self.pitch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Suspended,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveVoice {
    pub id: VoiceId,
    pub pitch: u8,
    pub started_at_ms: f64,
}

/// Outcome of allocating a voice. `stopped` voices (re-triggered pitch,
/// evicted oldest) must be silenced by the caller before the new one starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub voice_id: VoiceId,
    pub stopped: Vec<ActiveVoice>,
}

#[derive(Debug, Clone)]
pub struct VoiceTable {
    capacity: usize,
    next_id: VoiceId,
    voices: Vec<ActiveVoice>,
}

impl VoiceTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_id: DETACHED + 1,
            voices: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn contains(&self, voice_id: VoiceId) -> bool {
        self.voices.iter().any(|v| v.id == voice_id)
    }

    pub fn get(&self, voice_id: VoiceId) -> Option<&ActiveVoice> {
        self.voices.iter().find(|v| v.id == voice_id)
    }

    /// Voice with the smallest start time (lowest id on ties).
    pub fn oldest(&self) -> Option<&ActiveVoice> {
        self.voices.iter().min_by(|a, b| {
            a.started_at_ms
                .total_cmp(&b.started_at_ms)
                .then(a.id.cmp(&b.id))
        })
    }

    pub fn allocate(&mut self, pitch: u8, now_ms: f64) -> Allocation {
        let mut stopped = Vec::new();

        // Re-trigger: the pitch never overlaps itself.
        if let Some(pos) = self.voices.iter().position(|v| v.pitch == pitch) {
            stopped.push(self.voices.remove(pos));
        }

        while self.voices.len() >= self.capacity {
            let Some(oldest) = self.oldest().map(|v| v.id) else { break };
            if let Some(evicted) = self.release(oldest) {
                stopped.push(evicted);
            }
        }

        let voice_id = self.next_id;
        self.next_id += 1;
        self.voices.push(ActiveVoice { id: voice_id, pitch, started_at_ms: now_ms });
        Allocation { voice_id, stopped }
    }

    /// Forget a voice. `None` if it was never allocated or already gone.
    pub fn release(&mut self, voice_id: VoiceId) -> Option<ActiveVoice> {
        let pos = self.voices.iter().position(|v| v.id == voice_id)?;
        Some(self.voices.remove(pos))
    }

    pub fn release_pitch(&mut self, pitch: u8) -> Option<ActiveVoice> {
        let pos = self.voices.iter().position(|v| v.pitch == pitch)?;
        Some(self.voices.remove(pos))
    }

    pub fn drain(&mut self) -> Vec<ActiveVoice> {
        std::mem::take(&mut self.voices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_removes_oldest_start_time() {
        let mut table = VoiceTable::new(3);
        let a = table.allocate(60, 30.0).voice_id;
        let b = table.allocate(62, 10.0).voice_id;
        let c = table.allocate(64, 20.0).voice_id;

        let alloc = table.allocate(65, 40.0);
        assert_eq!(alloc.stopped.len(), 1);
        assert_eq!(alloc.stopped[0].id, b);
        assert!(table.contains(a) && table.contains(c) && table.contains(alloc.voice_id));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_retrigger_stops_same_pitch_without_evicting() {
        let mut table = VoiceTable::new(2);
        let first = table.allocate(60, 0.0).voice_id;
        let other = table.allocate(62, 1.0).voice_id;
        let again = table.allocate(60, 2.0);
        assert_eq!(again.stopped.len(), 1);
        assert_eq!(again.stopped[0].id, first);
        assert!(table.contains(other));
        assert_ne!(again.voice_id, first);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut table = VoiceTable::new(4);
        let id = table.allocate(60, 0.0).voice_id;
        assert!(table.release(id).is_some());
        assert!(table.release(id).is_none());
        assert!(table.release(9999).is_none());
        assert!(table.release_pitch(61).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_ties_evict_lowest_id() {
        let mut table = VoiceTable::new(2);
        let a = table.allocate(60, 5.0).voice_id;
        table.allocate(61, 5.0);
        let alloc = table.allocate(62, 5.0);
        assert_eq!(alloc.stopped[0].id, a);
    }

    #[test]
    fn test_detached_handle() {
        let engine = Uuid::new_v4();
        let handle = NoteHandle::detached(engine, 60);
        assert!(handle.is_detached());
        assert_eq!(handle.engine_id(), engine);
        assert!(!NoteHandle::new(engine, 1, 60).is_detached());
    }
}
