//! In-process input/output device pair
//!
//! The input side generates a moving gradient test pattern at the mode's
//! frame rate, optionally skewed to simulate an input clock drifting against
//! the output clock. The output side keeps a playout buffer, shows each
//! scheduled frame at its wall-clock deadline and reports completions like a
//! hardware device would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::sink::{CompletionStatus, OutputDevice, PlaybackCallbacks, PlaybackSink, ScheduledSlot};
use crate::capture::{CaptureCallbacks, Frame, InputDevice, PixelFormat, RawFrame, VideoMode};
use crate::error::{RelayError, Result};
use crate::pipeline::clock::Timebase;
use crate::{Config, MIN_CLOCK_SKEW_PPM};

/// Background thread with a stop channel
struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop, stop_rx) = flume::bounded(1);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || body(stop_rx))
            .map_err(|e| RelayError::device("spawn loopback thread", e.to_string()))?;
        Ok(Self { stop, handle })
    }

    fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        self.handle
            .join()
            .map_err(|_| RelayError::device("join loopback thread", "thread panicked"))
    }
}

struct ScheduledFrame {
    frame: Frame,
    slot: ScheduledSlot,
}

#[derive(Default)]
struct InputState {
    callback: Option<Arc<dyn CaptureCallbacks>>,
    mode: Option<VideoMode>,
    generator: Option<Worker>,
}

#[derive(Default)]
struct OutputState {
    mode: Option<VideoMode>,
    playout: Option<Worker>,
}

/// Simulated capture + playback device.
pub struct LoopbackDevice {
    time_scale: i64,
    clock_skew_ppm: i32,
    input: Mutex<InputState>,
    output: Mutex<OutputState>,
    completion: Arc<Mutex<Option<Arc<dyn PlaybackCallbacks>>>>,
    scheduled_tx: Sender<ScheduledFrame>,
    scheduled_rx: Receiver<ScheduledFrame>,
    buffered: Arc<AtomicUsize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LoopbackDevice {
    pub fn new(time_scale: i64, clock_skew_ppm: i32) -> Self {
        let (scheduled_tx, scheduled_rx) = flume::unbounded();
        Self {
            time_scale,
            clock_skew_ppm,
            input: Mutex::new(InputState::default()),
            output: Mutex::new(OutputState::default()),
            completion: Arc::new(Mutex::new(None)),
            scheduled_tx,
            scheduled_rx,
            buffered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.output.time_scale, config.loopback.clock_skew_ppm)
    }

    /// Release every frame still waiting in the playout buffer.
    fn flush_scheduled(&self) -> usize {
        flush(&self.scheduled_rx, &self.buffered, None)
    }
}

fn flush(
    scheduled: &Receiver<ScheduledFrame>,
    buffered: &AtomicUsize,
    callback: Option<&Arc<dyn PlaybackCallbacks>>,
) -> usize {
    let mut flushed = 0;
    for item in scheduled.try_iter() {
        buffered.fetch_sub(1, Ordering::Relaxed);
        if let Some(callback) = callback {
            callback.on_scheduled_frame_completed(&item.frame, CompletionStatus::Flushed);
        }
        flushed += 1;
    }
    flushed
}

/// Gradient scrolling one pixel per frame, opaque-ish grey ramp.
fn fill_test_pattern(pixels: &mut [u8], width: usize, index: u64) {
    for row in pixels.chunks_exact_mut(width * 4) {
        for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
            let value = ((x as u32).wrapping_add(index as u32) & 0xff) * 0x10101 + 0x7f00_0000;
            pixel.copy_from_slice(&value.to_le_bytes());
        }
    }
}

fn run_generator(
    callback: Arc<dyn CaptureCallbacks>,
    mode: VideoMode,
    timebase: Timebase,
    clock_skew_ppm: i32,
    stop: Receiver<()>,
) {
    let nominal = Duration::from_secs_f64(1.0 / mode.frame_rate.as_f64());
    // A fast input clock delivers frames early
    let period = nominal.div_f64(1.0 + clock_skew_ppm as f64 * 1e-6);
    let width = mode.width as usize;
    let mut pixels = vec![0u8; width * mode.height as usize * 4];
    let started = Instant::now();

    for index in 0u64.. {
        let deadline = started + period.mul_f64(index as f64);
        match stop.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }

        fill_test_pattern(&mut pixels, width, index);
        callback.on_frame_arrived(&RawFrame {
            width: mode.width,
            height: mode.height,
            row_bytes: width * 4,
            pixel_format: PixelFormat::Bgra8,
            data: &pixels,
            stream_time: Some(timebase.time_for(index)),
        });
    }
    debug!("Loopback generator stopped");
}

enum PlayoutEvent {
    Frame(ScheduledFrame),
    Stop,
}

fn run_playout(
    scheduled: Receiver<ScheduledFrame>,
    completion: Arc<Mutex<Option<Arc<dyn PlaybackCallbacks>>>>,
    buffered: Arc<AtomicUsize>,
    start_time: i64,
    stop: Receiver<()>,
) {
    let started = Instant::now();
    let callback = || lock(&completion).clone();

    loop {
        let event = flume::Selector::new()
            .recv(&stop, |_| PlayoutEvent::Stop)
            .recv(&scheduled, |item| item.map_or(PlayoutEvent::Stop, PlayoutEvent::Frame))
            .wait();

        let PlayoutEvent::Frame(item) = event else {
            break;
        };

        let offset = (item.slot.presentation_time - start_time).max(0) as f64
            / item.slot.time_scale as f64;
        let deadline = started + Duration::from_secs_f64(offset);

        if !matches!(stop.recv_deadline(deadline), Err(RecvTimeoutError::Timeout)) {
            buffered.fetch_sub(1, Ordering::Relaxed);
            if let Some(cb) = callback() {
                cb.on_scheduled_frame_completed(&item.frame, CompletionStatus::Flushed);
            }
            break;
        }

        let frame_time =
            Duration::from_secs_f64(item.slot.duration as f64 / item.slot.time_scale as f64);
        let status = if deadline.elapsed() > frame_time {
            CompletionStatus::DisplayedLate
        } else {
            CompletionStatus::OnTime
        };

        buffered.fetch_sub(1, Ordering::Relaxed);
        if let Some(cb) = callback() {
            cb.on_scheduled_frame_completed(&item.frame, status);
        }
    }

    let cb = callback();
    let flushed = flush(&scheduled, &buffered, cb.as_ref());
    debug!("Playout stopped, {} frames flushed", flushed);
    if let Some(cb) = cb {
        cb.on_playback_stopped();
    }
}

impl InputDevice for LoopbackDevice {
    fn set_callback(&self, callback: Option<Arc<dyn CaptureCallbacks>>) -> Result<()> {
        lock(&self.input).callback = callback;
        Ok(())
    }

    fn enable_input(&self, mode: &VideoMode) -> Result<()> {
        if mode.pixel_format != PixelFormat::Bgra8 {
            warn!("Loopback input always produces BGRA, ignoring {:?}", mode.pixel_format);
        }
        info!("Loopback input enabled: {}", mode.name);
        lock(&self.input).mode = Some(mode.clone());
        Ok(())
    }

    fn start_streams(&self) -> Result<()> {
        let mut input = lock(&self.input);
        if input.generator.is_some() {
            return Err(RelayError::device("start streams", "already streaming"));
        }
        let mode = input
            .mode
            .clone()
            .ok_or_else(|| RelayError::device("start streams", "input not enabled"))?;
        let callback = input
            .callback
            .clone()
            .ok_or_else(|| RelayError::device("start streams", "no capture callback"))?;
        let timebase = Timebase::new(self.time_scale, mode.frame_rate)?;
        let skew = self.clock_skew_ppm;
        if skew <= MIN_CLOCK_SKEW_PPM {
            return Err(RelayError::InvalidConfig(format!(
                "clock skew {skew} ppm stops the input clock"
            )));
        }

        input.generator = Some(Worker::spawn("loopback-input", move |stop| {
            run_generator(callback, mode, timebase, skew, stop)
        })?);
        Ok(())
    }

    fn stop_streams(&self) -> Result<()> {
        let generator = lock(&self.input).generator.take();
        match generator {
            Some(worker) => worker.shutdown(),
            None => Ok(()),
        }
    }

    fn disable_input(&self) -> Result<()> {
        self.stop_streams()?;
        lock(&self.input).mode = None;
        Ok(())
    }
}

impl PlaybackSink for LoopbackDevice {
    fn schedule(&self, frame: Frame, slot: ScheduledSlot) -> Result<()> {
        if lock(&self.output).mode.is_none() {
            return Err(RelayError::device("schedule frame", "output not enabled"));
        }
        if slot.time_scale <= 0 || slot.duration <= 0 {
            return Err(RelayError::device(
                "schedule frame",
                format!("invalid timing {:?}", slot),
            ));
        }

        self.buffered.fetch_add(1, Ordering::Relaxed);
        self.scheduled_tx
            .send(ScheduledFrame { frame, slot })
            .map_err(|_| RelayError::device("schedule frame", "playout buffer closed"))
    }
}

impl OutputDevice for LoopbackDevice {
    fn set_completion_callback(&self, callback: Option<Arc<dyn PlaybackCallbacks>>) -> Result<()> {
        *lock(&self.completion) = callback;
        Ok(())
    }

    fn enable_output(&self, mode: &VideoMode) -> Result<()> {
        info!("Loopback output enabled: {}", mode.name);
        lock(&self.output).mode = Some(mode.clone());
        Ok(())
    }

    fn start_scheduled_playback(&self, start_time: i64, time_scale: i64) -> Result<()> {
        let mut output = lock(&self.output);
        if output.mode.is_none() {
            return Err(RelayError::device("start playback", "output not enabled"));
        }
        if output.playout.is_some() {
            return Err(RelayError::device("start playback", "already playing"));
        }
        if time_scale != self.time_scale {
            return Err(RelayError::device(
                "start playback",
                format!("time scale {} does not match device {}", time_scale, self.time_scale),
            ));
        }

        let scheduled = self.scheduled_rx.clone();
        let completion = self.completion.clone();
        let buffered = self.buffered.clone();
        output.playout = Some(Worker::spawn("loopback-playout", move |stop| {
            run_playout(scheduled, completion, buffered, start_time, stop)
        })?);
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> Result<()> {
        let playout = lock(&self.output).playout.take();
        match playout {
            Some(worker) => worker.shutdown(),
            None => Ok(()),
        }
    }

    fn disable_output(&self) -> Result<()> {
        self.stop_scheduled_playback()?;
        let released = self.flush_scheduled();
        if released > 0 {
            debug!("Released {} unplayed frames", released);
        }
        lock(&self.output).mode = None;
        Ok(())
    }

    fn buffered_frame_count(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}
