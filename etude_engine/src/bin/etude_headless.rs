use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use etude_engine::export::{BounceFormat, SessionBounce};
use etude_engine::input::InputKind;
use etude_engine::mic::{MicCapture, PitchTrackerConfig};
use etude_engine::midi::MidiControllerInput;
use etude_engine::output::OfflineOutput;
use etude_engine::transport::TICK_PERIOD_MS;
use etude_engine::{
    create_engine, input_channel, share, ClockCommand, ClockEvent, ClockOptions, ClockRunner, ClockState, HostClock,
    InputSender, OscillatorEngine, PlaybackClock, RawInputEvent, SharedEngine, SynthEngine,
};
use etude_shared::{EnginePreference, ExerciseDefinition, InputSource, PlayerSettings, ScoreBreakdown};

const RENDER_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EngineArg {
    Auto,
    Oscillator,
    Pooled,
}

impl From<EngineArg> for EnginePreference {
    fn from(arg: EngineArg) -> Self {
        match arg {
            EngineArg::Auto => EnginePreference::Auto,
            EngineArg::Oscillator => EnginePreference::Oscillator,
            EngineArg::Pooled => EnginePreference::Pooled,
        }
    }
}

/// Run one exercise without a UI and print the score as JSON.
#[derive(Debug, Parser)]
#[command(name = "etude-headless")]
struct Args {
    /// Exercise definition (JSON).
    exercise: PathBuf,
    /// Player settings (JSON). Defaults apply when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Feed a note-perfect performance through the preferred input source.
    #[arg(long)]
    autoplay: bool,
    /// Drive the clock in real time on the audio device instead of simulated time.
    #[arg(long)]
    realtime: bool,
    /// Open the adapter for the preferred input source (real time only).
    #[arg(long)]
    listen: bool,
    #[arg(long, value_enum)]
    engine: Option<EngineArg>,
    /// Bounce the simulated session to a WAV file.
    #[arg(long)]
    render: Option<PathBuf>,
    #[arg(long, default_value_t = 0.0)]
    previous_high: f64,
}

/// Timed presses for every note, as `source` would observe them.
fn perfect_take(exercise: &ExerciseDefinition, start_ms: f64, source: InputSource) -> Vec<RawInputEvent> {
    let comp = source.profile().latency_compensation_ms;
    let downbeat = start_ms + exercise.count_in_ms();
    let mut take = Vec::with_capacity(exercise.notes.len() * 2);
    for note in &exercise.notes {
        let on = downbeat + exercise.expected_time_ms(note) + comp;
        let off = on + exercise.expected_duration_ms(note) * 0.9;
        take.push(RawInputEvent { source, pitch: note.pitch, kind: InputKind::NoteOn { velocity: 96 }, observed_ms: on });
        take.push(RawInputEvent { source, pitch: note.pitch, kind: InputKind::NoteOff, observed_ms: off });
    }
    take.sort_by(|a, b| a.observed_ms.total_cmp(&b.observed_ms));
    take
}

fn session_ms_limit(exercise: &ExerciseDefinition) -> f64 {
    exercise.count_in_ms() + (exercise.last_expected_end_beat() + 2.0) * exercise.ms_per_beat()
}

/// Simulated time: ticks are exact, the engine renders offline.
fn run_simulated(
    exercise: Arc<ExerciseDefinition>,
    settings: &PlayerSettings,
    options: ClockOptions,
    autoplay: bool,
    render: Option<PathBuf>,
) -> Result<ScoreBreakdown, anyhow::Error> {
    let output = OfflineOutput::new(RENDER_RATE, 2);
    let mut bounce = SessionBounce::new(output.tap(), RENDER_RATE);
    let mut synth = OscillatorEngine::new(Box::new(output), settings.polyphony, settings.master_volume);
    synth.initialize()?;
    let engine = share(Box::new(synth));

    let (mut clock, _events) = PlaybackClock::new(exercise.clone(), Some(engine.clone()), options);
    let take = if autoplay { perfect_take(&exercise, 0.0, settings.preferred_input) } else { Vec::new() };
    let mut take = take.into_iter().peekable();
    let limit = session_ms_limit(&exercise);
    let step = TICK_PERIOD_MS as f64;

    clock.start(0.0);
    let mut now = 0.0;
    while clock.state() != ClockState::Completed && now <= limit {
        clock.tick(now);
        while let Some(event) = take.next_if(|e| e.observed_ms <= now) {
            clock.handle_input(event);
        }
        bounce.pump_ms(step);
        now += step;
    }
    clock.stop(now);

    if let Some(path) = render {
        // Let release tails ring out.
        bounce.pump_ms(500.0);
        bounce.write(&path, BounceFormat::Int16).with_context(|| format!("writing {}", path.display()))?;
        println!("[Headless] Wrote {} frames to {} (peak {:.3})", bounce.frames(), path.display(), bounce.peak());
    }
    engine_dispose(&engine);

    clock.result().context("session ended before completion")
}

fn engine_dispose(engine: &SharedEngine) {
    etude_engine::with_engine(engine, |e| e.dispose());
}

fn spawn_autoplay(sender: InputSender, take: Vec<RawInputEvent>) {
    let clock = sender.clock();
    thread::spawn(move || {
        for event in take {
            let wait = event.observed_ms - clock.now_ms();
            if wait > 0.0 {
                thread::sleep(Duration::from_secs_f64(wait / 1000.0));
            }
            sender.send(event);
        }
    });
}

fn wait_for_score(events: &Receiver<ClockEvent>, timeout: Duration) -> Result<ScoreBreakdown, anyhow::Error> {
    loop {
        match events.recv_timeout(timeout) {
            Ok(ClockEvent::Completed(score)) => return Ok(score),
            Ok(ClockEvent::CountIn { beat, is_ready }) => {
                println!("[Headless] Count-in {}{}", beat, if is_ready { " (ready)" } else { "" });
            }
            Ok(ClockEvent::Error(message)) => println!("[Headless] Error: {}", message),
            Ok(_) => {}
            Err(e) => bail!("no result from the clock: {}", e),
        }
    }
}

/// Real time: the audio device sounds, a scheduler thread owns the clock.
fn run_realtime(
    exercise: Arc<ExerciseDefinition>,
    settings: &PlayerSettings,
    options: ClockOptions,
    autoplay: bool,
    listen: bool,
) -> Result<ScoreBreakdown, anyhow::Error> {
    let selection = create_engine(settings);
    println!("[Headless] Using {} engine", selection.kind);

    let host = HostClock::new();
    let (sender, inputs) = input_channel(etude_engine::input::INPUT_QUEUE, host);
    let (clock, events) = PlaybackClock::new(exercise.clone(), Some(selection.engine.clone()), options);
    let runner = ClockRunner::spawn(clock, inputs, host)?;
    if let Some(warning) = &selection.warning {
        runner.send(ClockCommand::ReportError(warning.clone()));
    }

    let mut midi = None;
    let mut mic = None;
    if listen {
        match settings.preferred_input {
            InputSource::Controller => match MidiControllerInput::open(sender.clone()) {
                Ok(input) => midi = Some(input),
                Err(e) => {
                    runner.send(ClockCommand::ReportError(format!("MIDI unavailable: {}", e)));
                }
            },
            InputSource::Mic => match MicCapture::start(sender.clone(), PitchTrackerConfig::default()) {
                Ok(capture) => {
                    runner.send(ClockCommand::SetSourceProfile { source: InputSource::Mic, profile: capture.profile() });
                    mic = Some(capture);
                }
                Err(e) => {
                    runner.send(ClockCommand::ReportError(format!("microphone unavailable: {}", e)));
                }
            },
            InputSource::Touch => println!("[Headless] Touch input has no device to open"),
        }
    }

    let start = host.now_ms();
    runner.send(ClockCommand::Start);
    if autoplay {
        spawn_autoplay(sender.clone(), perfect_take(&exercise, start, settings.preferred_input));
    }

    let timeout = Duration::from_secs_f64(session_ms_limit(&exercise) / 1000.0 + 5.0);
    let score = wait_for_score(&events, timeout);

    if let Some(mut capture) = mic {
        capture.stop();
    }
    if let Some(input) = midi {
        input.close();
    }
    runner.shutdown()?;
    engine_dispose(&selection.engine);
    score
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let exercise = ExerciseDefinition::from_path(&args.exercise)?;
    let mut settings = match &args.settings {
        Some(path) => PlayerSettings::from_path(path)?,
        None => PlayerSettings::default(),
    };
    if let Some(engine) = args.engine {
        settings.engine = engine.into();
    }
    if args.listen && !args.realtime {
        bail!("--listen needs --realtime");
    }

    println!(
        "[Headless] '{}': {} notes at {} BPM",
        exercise.title,
        exercise.notes.len(),
        exercise.settings.tempo_bpm
    );
    let options = ClockOptions { previous_high_score: args.previous_high, ..ClockOptions::from_settings(&settings) };
    let exercise = Arc::new(exercise);

    let score = if args.realtime {
        run_realtime(exercise, &settings, options, args.autoplay, args.listen)?
    } else {
        run_simulated(exercise, &settings, options, args.autoplay, args.render)?
    };

    println!("{}", serde_json::to_string_pretty(&score)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use etude_shared::NoteEvent;

    #[test]
    fn test_perfect_take_is_compensated_per_source() {
        let mut exercise = ExerciseDefinition { notes: vec![NoteEvent::new(64, 1.0, 1.0), NoteEvent::new(60, 0.0, 1.0)], ..Default::default() };
        exercise.settings.count_in_beats = 2;

        let take = perfect_take(&exercise, 100.0, InputSource::Mic);
        assert_eq!(take.len(), 4);
        assert!(take.iter().all(|e| e.source == InputSource::Mic));
        assert_eq!(take[0].pitch, 60);
        // 100 ms start + 1000 ms count-in + 80 ms mic delay.
        assert_eq!(take[0].observed_ms, 1_180.0);
        assert!(take.windows(2).all(|w| w[0].observed_ms <= w[1].observed_ms));

        let touch = perfect_take(&exercise, 100.0, InputSource::Touch);
        assert_eq!(touch[0].observed_ms, 1_130.0);
    }
}
