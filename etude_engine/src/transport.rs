//! Beat math and the status snapshot read by the presentation layer.

use arc_swap::ArcSwap;
use std::sync::Arc;

use etude_shared::ScoreBreakdown;

/// Clock tick period.
pub const TICK_PERIOD_MS: u64 = 16;
/// Period of the throttled beat notification (20 Hz).
pub const NOTIFY_PERIOD_MS: f64 = 50.0;
/// Beats past the last expected note after which the exercise ends regardless.
pub const COMPLETION_GRACE_BEATS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockState {
    #[default]
    Idle,
    CountIn,
    Playing,
    Paused,
    Completed,
}

/// Converts elapsed session time (pauses excluded) to beats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatMap {
    pub ms_per_beat: f64,
    pub count_in_beats: u32,
}

impl BeatMap {
    pub fn new(ms_per_beat: f64, count_in_beats: u32) -> Self {
        let ms_per_beat = if ms_per_beat.is_finite() && ms_per_beat > 0.0 { ms_per_beat } else { 500.0 };
        Self { ms_per_beat, count_in_beats }
    }

    /// Negative during the count-in, 0 at the first scored beat.
    pub fn beat_at(&self, elapsed_ms: f64) -> f64 {
        elapsed_ms / self.ms_per_beat - self.count_in_beats as f64
    }

    /// 1-based count-in beat, `None` once the count-in is over.
    pub fn count_in_beat(&self, elapsed_ms: f64) -> Option<u32> {
        if self.count_in_beats == 0 || elapsed_ms < 0.0 {
            return None;
        }
        let beat = (elapsed_ms / self.ms_per_beat).floor() as u32 + 1;
        (beat <= self.count_in_beats).then_some(beat)
    }

    pub fn count_in_ms(&self) -> f64 {
        self.count_in_beats as f64 * self.ms_per_beat
    }

    /// Milliseconds after beat 0.
    pub fn session_ms(&self, elapsed_ms: f64) -> f64 {
        elapsed_ms - self.count_in_ms()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStatus {
    pub state: ClockState,
    pub is_playing: bool,
    pub current_beat: f64,
    pub count_in_beat: Option<u32>,
    /// Set on the last count-in beat.
    pub is_ready: bool,
    pub has_error: bool,
    pub error_message: Option<String>,
    pub loop_count: u32,
    pub played_count: usize,
    /// Score of the completed session; stays set until the next start or reset.
    pub result: Option<ScoreBreakdown>,
}

/// Lock-free status surface; writers publish whole snapshots.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<ArcSwap<TransportStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TransportStatus {
        (**self.inner.load()).clone()
    }

    pub fn publish(&self, status: TransportStatus) {
        self.inner.store(Arc::new(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_in_beats_at_120_bpm() {
        let map = BeatMap::new(500.0, 4);
        assert_eq!(map.count_in_beat(0.0), Some(1));
        assert_eq!(map.count_in_beat(500.0), Some(2));
        assert_eq!(map.count_in_beat(1000.0), Some(3));
        assert_eq!(map.count_in_beat(1500.0), Some(4));
        assert_eq!(map.count_in_beat(1999.0), Some(4));
        assert_eq!(map.count_in_beat(2000.0), None);
    }

    #[test]
    fn test_beat_position() {
        let map = BeatMap::new(500.0, 4);
        assert_eq!(map.beat_at(0.0), -4.0);
        assert_eq!(map.beat_at(2000.0), 0.0);
        assert_eq!(map.beat_at(2750.0), 1.5);
        assert_eq!(map.session_ms(2750.0), 750.0);
        assert_eq!(BeatMap::new(500.0, 0).count_in_beat(0.0), None);
    }

    #[test]
    fn test_invalid_tempo_falls_back() {
        assert_eq!(BeatMap::new(f64::INFINITY, 0).ms_per_beat, 500.0);
    }

    #[test]
    fn test_status_board_publishes_snapshots() {
        let board = StatusBoard::new();
        let reader = board.clone();
        board.publish(TransportStatus { is_playing: true, current_beat: 2.5, ..Default::default() });
        let snap = reader.snapshot();
        assert!(snap.is_playing);
        assert_eq!(snap.current_beat, 2.5);
    }
}
