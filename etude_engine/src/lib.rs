pub mod assets;
pub mod clock;
pub mod commands;
pub mod engine; // SynthEngine trait and factory live here
pub mod envelope;
pub mod export;
pub mod input;
pub mod mic;
pub mod midi;
pub mod mixer;
pub mod nodes;
pub mod oscillator;
pub mod output;
pub mod pooled;
pub mod resampler;
pub mod scheduler;
pub mod scoring;
pub mod transport;
pub mod voice;

mod tests_session;

// Re-exports
pub use clock::{ClockOptions, PlaybackClock};
pub use commands::{ClockCommand, ClockEvent};
pub use engine::{create_engine, share, with_engine, EngineKind, EngineSelection, SharedEngine, SynthEngine};
pub use input::{input_channel, HostClock, InputNormalizer, InputSender, RawInputEvent, TouchKeys};
pub use oscillator::OscillatorEngine;
pub use pooled::PooledEngine;
pub use scheduler::ClockRunner;
pub use scoring::ScoringEngine;
pub use transport::{ClockState, TransportStatus};
pub use voice::{EngineState, NoteHandle};
