//! The one periodic timer that drives a `PlaybackClock`.
//!
//! A dedicated thread owns the clock. Commands, input events and ticks are
//! multiplexed with `select!`, so a pause is applied between two ticks and
//! never races one.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::PlaybackClock;
use crate::commands::ClockCommand;
use crate::input::{HostClock, RawInputEvent};
use crate::transport::{StatusBoard, TransportStatus, TICK_PERIOD_MS};

pub struct ClockRunner {
    commands: Sender<ClockCommand>,
    status: StatusBoard,
    thread: Option<JoinHandle<()>>,
}

fn apply(clock: &mut PlaybackClock, cmd: ClockCommand, now_ms: f64) {
    match cmd {
        ClockCommand::Start => clock.start(now_ms),
        ClockCommand::Pause => clock.pause(now_ms),
        ClockCommand::Resume => clock.resume(now_ms),
        ClockCommand::Stop => clock.stop(now_ms),
        ClockCommand::Restart => clock.restart(now_ms),
        ClockCommand::Reset => clock.reset(now_ms),
        ClockCommand::SetVolume(v) => clock.set_volume(v),
        ClockCommand::SetSourceProfile { source, profile } => clock.set_source_profile(source, profile),
        ClockCommand::ReportError(message) => clock.set_error(message),
        ClockCommand::Shutdown { .. } => {}
    }
}

impl ClockRunner {
    pub fn spawn(clock: PlaybackClock, inputs: Receiver<RawInputEvent>, host: HostClock) -> Result<Self> {
        Self::with_period(clock, inputs, host, Duration::from_millis(TICK_PERIOD_MS))
    }

    pub fn with_period(
        mut clock: PlaybackClock,
        inputs: Receiver<RawInputEvent>,
        host: HostClock,
        period: Duration,
    ) -> Result<Self> {
        let (commands, command_rx) = bounded::<ClockCommand>(64);
        let status = clock.status();

        let thread = std::thread::Builder::new().name("etude-clock".into()).spawn(move || {
            let ticker = tick(period);
            let mut inputs = inputs;
            loop {
                select! {
                    recv(command_rx) -> msg => match msg {
                        Ok(ClockCommand::Shutdown { response_tx }) => {
                            clock.stop(host.now_ms());
                            let _ = response_tx.send(clock);
                            return;
                        }
                        Ok(cmd) => apply(&mut clock, cmd, host.now_ms()),
                        Err(_) => {
                            clock.stop(host.now_ms());
                            return;
                        }
                    },
                    recv(inputs) -> event => match event {
                        Ok(event) => clock.handle_input(event),
                        Err(_) => {
                            log::debug!("[Clock] Input channel closed");
                            inputs = never();
                        }
                    },
                    recv(ticker) -> _ => {
                        while let Ok(event) = inputs.try_recv() {
                            clock.handle_input(event);
                        }
                        clock.tick(host.now_ms());
                    }
                }
            }
        })?;

        Ok(Self { commands, status, thread: Some(thread) })
    }

    pub fn commands(&self) -> Sender<ClockCommand> {
        self.commands.clone()
    }

    pub fn send(&self, cmd: ClockCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    pub fn status(&self) -> TransportStatus {
        self.status.snapshot()
    }

    /// Stop the thread and take the clock back.
    pub fn shutdown(mut self) -> Result<PlaybackClock> {
        let (response_tx, response_rx) = bounded(1);
        self.commands
            .send(ClockCommand::Shutdown { response_tx })
            .map_err(|_| anyhow!("clock thread already exited"))?;
        let clock = response_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow!("clock thread did not hand the clock back"))?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(clock)
    }
}

impl Drop for ClockRunner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let (response_tx, _response_rx) = bounded(1);
            let _ = self.commands.send(ClockCommand::Shutdown { response_tx });
            if thread.join().is_err() {
                log::warn!("[Clock] Scheduler thread panicked");
            }
        }
    }
}
