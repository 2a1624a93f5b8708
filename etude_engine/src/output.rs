//! Audio output backends.
//!
//! `CpalOutput` keeps the device stream on a dedicated owner thread and talks
//! to it over a control channel, so engines stay `Send` on every platform.
//! `OfflineOutput` has no device at all; a `OfflineTap` pulls frames on demand.

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::nodes::Render;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub buffer_frames: u32,
}

impl OutputInfo {
    pub fn buffer_latency(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

pub trait AudioOutput: Send {
    fn name(&self) -> &'static str;
    /// Query the device without opening it.
    fn probe(&mut self) -> Result<OutputInfo>;
    fn open(&mut self, renderer: Box<dyn Render>) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    /// Tear down. Never fails; problems are logged.
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPreference {
    /// Fixed device buffer of this many frames; probing fails if unsupported.
    LowLatency(u32),
    DeviceDefault,
}

enum StreamControl {
    Play,
    Pause,
    Close,
}

/// Nominal block size assumed when the device does not report one.
const DEFAULT_BUFFER_FRAMES: u32 = 1024;

pub struct CpalOutput {
    buffer: BufferPreference,
    info: Option<OutputInfo>,
    control_tx: Option<Sender<StreamControl>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn low_latency(frames: u32) -> Self {
        Self::new(BufferPreference::LowLatency(frames))
    }

    pub fn device_default() -> Self {
        Self::new(BufferPreference::DeviceDefault)
    }

    pub fn new(buffer: BufferPreference) -> Self {
        Self { buffer, info: None, control_tx: None, thread: None }
    }

    fn send(&self, ctl: StreamControl) -> Result<()> {
        let tx = self.control_tx.as_ref().ok_or_else(|| anyhow!("output stream is not open"))?;
        tx.send(ctl).map_err(|_| anyhow!("output stream thread has exited"))
    }
}

fn stream_config(buffer: BufferPreference) -> Result<(cpal::Device, cpal::StreamConfig, cpal::SampleFormat, OutputInfo)> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(anyhow!("No output device available"))?;
    let config = device.default_output_config()?;

    let sample_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let sample_format = config.sample_format();
    let supported = config.buffer_size().clone();

    let mut stream_config: cpal::StreamConfig = config.into();
    let buffer_frames = match (buffer, supported) {
        (BufferPreference::LowLatency(frames), cpal::SupportedBufferSize::Range { min, max }) => {
            if frames < min || frames > max {
                return Err(anyhow!("low-latency buffer of {} frames unsupported (device range {}-{})", frames, min, max));
            }
            stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
            frames
        }
        (BufferPreference::LowLatency(_), cpal::SupportedBufferSize::Unknown) => {
            return Err(anyhow!("device does not report a configurable buffer size"));
        }
        (BufferPreference::DeviceDefault, cpal::SupportedBufferSize::Range { min, max }) => {
            DEFAULT_BUFFER_FRAMES.clamp(min, max.max(min))
        }
        (BufferPreference::DeviceDefault, cpal::SupportedBufferSize::Unknown) => DEFAULT_BUFFER_FRAMES,
    };

    let info = OutputInfo { sample_rate, channels, buffer_frames };
    Ok((device, stream_config, sample_format, info))
}

fn build_stream<T>(device: &cpal::Device, config: &cpal::StreamConfig, mut renderer: Box<dyn Render>) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::with_capacity(4096);
    let err_fn = |err: cpal::StreamError| {
        let s = err.to_string();
        // Under/overruns are routine and would flood the log.
        if !s.contains("underrun") && !s.contains("overrun") {
            log::warn!("[Output] Stream error: {}", s);
        }
    };
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            if scratch.len() != data.len() {
                scratch.resize(data.len(), 0.0);
            }
            renderer.render(&mut scratch, channels);
            for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                *out = <T as cpal::Sample>::from_sample(s);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

impl AudioOutput for CpalOutput {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn probe(&mut self) -> Result<OutputInfo> {
        let (_, _, _, info) = stream_config(self.buffer)?;
        self.info = Some(info);
        Ok(info)
    }

    fn open(&mut self, renderer: Box<dyn Render>) -> Result<()> {
        if self.control_tx.is_some() {
            return Ok(());
        }
        let buffer = self.buffer;
        let (ready_tx, ready_rx) = bounded::<Result<OutputInfo>>(1);
        let (control_tx, control_rx) = bounded::<StreamControl>(16);

        let thread = std::thread::Builder::new()
            .name("etude-output".into())
            .spawn(move || {
                let opened = stream_config(buffer).and_then(|(device, config, format, info)| {
                    let stream = match format {
                        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, renderer)?,
                        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, renderer)?,
                        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, renderer)?,
                        other => return Err(anyhow!("Unsupported sample format {:?}", other)),
                    };
                    stream.play()?;
                    Ok((stream, info))
                });
                let stream = match opened {
                    Ok((stream, info)) => {
                        let _ = ready_tx.send(Ok(info));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for ctl in control_rx {
                    let result = match ctl {
                        StreamControl::Play => stream.play().map_err(anyhow::Error::from),
                        StreamControl::Pause => stream.pause().map_err(anyhow::Error::from),
                        StreamControl::Close => break,
                    };
                    if let Err(e) = result {
                        log::warn!("[Output] Stream control failed: {}", e);
                    }
                }
                drop(stream);
            })?;

        let info = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| anyhow!("output thread did not report readiness"))??;
        log::info!(
            "[Output] Opened {} Hz, {} ch, {} frame buffer",
            info.sample_rate,
            info.channels,
            info.buffer_frames
        );
        self.info = Some(info);
        self.control_tx = Some(control_tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.send(StreamControl::Pause)
    }

    fn play(&mut self) -> Result<()> {
        self.send(StreamControl::Play)
    }

    fn close(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(StreamControl::Close);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("[Output] Output thread panicked during close");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pull side of an `OfflineOutput`.
#[derive(Clone)]
pub struct OfflineTap {
    renderer: Arc<Mutex<Option<Box<dyn Render>>>>,
    running: Arc<AtomicBool>,
    channels: usize,
}

impl OfflineTap {
    /// Render `frames` interleaved frames. Silence while closed or paused.
    pub fn pump(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.channels];
        if !self.running.load(Ordering::Acquire) {
            return out;
        }
        let mut guard = self.renderer.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(renderer) = guard.as_mut() {
            renderer.render(&mut out, self.channels);
        }
        out
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

pub struct OfflineOutput {
    info: OutputInfo,
    tap: OfflineTap,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            info: OutputInfo { sample_rate, channels, buffer_frames: 256 },
            tap: OfflineTap {
                renderer: Arc::new(Mutex::new(None)),
                running: Arc::new(AtomicBool::new(false)),
                channels,
            },
        }
    }

    pub fn tap(&self) -> OfflineTap {
        self.tap.clone()
    }
}

impl AudioOutput for OfflineOutput {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn probe(&mut self) -> Result<OutputInfo> {
        Ok(self.info)
    }

    fn open(&mut self, renderer: Box<dyn Render>) -> Result<()> {
        let mut guard = self.tap.renderer.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(renderer);
        self.tap.running.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.tap.running.store(false, Ordering::Release);
        Ok(())
    }

    fn play(&mut self) -> Result<()> {
        self.tap.running.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) {
        self.tap.running.store(false, Ordering::Release);
        let mut guard = self.tap.renderer.lock().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ramp(f32);

    impl Render for Ramp {
        fn render(&mut self, output: &mut [f32], channels: usize) {
            for frame in output.chunks_mut(channels) {
                self.0 += 1.0;
                frame.fill(self.0);
            }
        }
    }

    #[test]
    fn test_offline_tap_follows_lifecycle() {
        let mut output = OfflineOutput::new(48_000, 2);
        let tap = output.tap();
        assert!(tap.pump(4).iter().all(|s| *s == 0.0));

        output.open(Box::new(Ramp(0.0))).unwrap();
        assert_eq!(tap.pump(2), vec![1.0, 1.0, 2.0, 2.0]);

        output.pause().unwrap();
        assert!(tap.pump(2).iter().all(|s| *s == 0.0));
        output.play().unwrap();
        assert_eq!(tap.pump(1), vec![3.0, 3.0]);

        output.close();
        assert!(tap.pump(2).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_buffer_latency() {
        let info = OutputInfo { sample_rate: 48_000, channels: 2, buffer_frames: 480 };
        assert_eq!(info.buffer_latency(), Duration::from_millis(10));
    }
}
