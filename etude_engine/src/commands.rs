use crossbeam_channel::Sender;

use etude_shared::{InputSource, ScoreBreakdown, SourceProfile};

use crate::clock::PlaybackClock;
use crate::transport::ClockState;

/// Control messages for the clock scheduler thread.
pub enum ClockCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Restart,
    Reset,
    SetVolume(f32),
    /// Timing profile reported by an input adapter.
    SetSourceProfile { source: InputSource, profile: SourceProfile },
    /// Surface a collaborator failure (e.g. input capture) in the status.
    ReportError(String),
    /// Stop the scheduler and hand the clock back.
    Shutdown { response_tx: Sender<PlaybackClock> },
}

/// Notifications from the clock, delivered on a bounded channel. A full
/// channel never blocks the tick: beat updates are dropped, other
/// notifications push out the oldest queued one.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    StateChanged { from: ClockState, to: ClockState },
    /// New count-in beat; `is_ready` only on the last one.
    CountIn { beat: u32, is_ready: bool },
    /// Throttled beat position.
    Beat { beat: f64 },
    Looped { count: u32 },
    /// Sent once per non-looping session.
    Completed(ScoreBreakdown),
    Error(String),
}
