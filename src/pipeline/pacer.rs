//! Output pacing: decides which frame goes out next and when
//!
//! Two strategies share one interface:
//! - [`FreeRunningSender`]: a dedicated thread blocking on the frame source
//!   and scheduling by frame count plus a fixed output latency.
//! - [`CompletionDriven`]: the device's completion callback pulls the next
//!   frame, filling gaps with a blank frame and skipping one queued frame
//!   whenever the device reports a late display.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::clock::{OutputClock, Timebase, TimestampSource};
use super::queue::{FrameSource, TryPopError};
use crate::capture::Frame;
use crate::error::{RelayError, Result};
use crate::output::{CompletionStatus, OutputDevice, PlaybackCallbacks, PlaybackSink};

/// Fatal errors raised on pacing threads, drained by whoever supervises the relay.
pub type FaultSender = flume::Sender<RelayError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacingMode {
    /// Dedicated sender thread, count-based schedule
    FreeRunning,
    /// Scheduling driven by the device's frame completion callback
    #[default]
    CompletionDriven,
}

/// Everything a pacing strategy needs to know about the output timeline
#[derive(Debug, Clone, Copy)]
pub struct PacerSettings {
    pub timebase: Timebase,
    pub width: u32,
    pub height: u32,
    pub output_latency_frames: u32,
    pub preroll_frames: u32,
    pub timestamps: TimestampSource,
    /// Pin the sender thread to this CPU core
    pub sender_core: Option<usize>,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    live: AtomicU64,
    blank: AtomicU64,
    on_time: AtomicU64,
    late: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    skipped: AtomicU64,
}

/// Observability context owned by a pacer
#[derive(Default)]
pub struct PacerStats {
    counters: CachePadded<Counters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacerSnapshot {
    pub scheduled: u64,
    pub live: u64,
    pub blank: u64,
    pub on_time: u64,
    pub late: u64,
    pub dropped: u64,
    pub flushed: u64,
    /// Queued frames discarded to catch up after a late display
    pub skipped: u64,
}

impl PacerStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_scheduled(&self, blank: bool) {
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        if blank {
            self.counters.blank.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("framerelay_frames_blank_total").increment(1);
        } else {
            self.counters.live.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("framerelay_frames_live_total").increment(1);
        }
        metrics::counter!("framerelay_frames_scheduled_total").increment(1);
    }

    fn record_completion(&self, status: CompletionStatus) {
        let (counter, name) = match status {
            CompletionStatus::OnTime => (&self.counters.on_time, "framerelay_frames_on_time_total"),
            CompletionStatus::DisplayedLate => (&self.counters.late, "framerelay_frames_late_total"),
            CompletionStatus::Dropped => (&self.counters.dropped, "framerelay_frames_dropped_total"),
            CompletionStatus::Flushed => (&self.counters.flushed, "framerelay_frames_flushed_total"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(name).increment(1);
    }

    fn record_skip(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framerelay_frames_skipped_total").increment(1);
    }

    pub fn snapshot(&self) -> PacerSnapshot {
        let c = &self.counters;
        PacerSnapshot {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            live: c.live.load(Ordering::Relaxed),
            blank: c.blank.load(Ordering::Relaxed),
            on_time: c.on_time.load(Ordering::Relaxed),
            late: c.late.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
        }
    }
}

fn report_fault(faults: &FaultSender, e: RelayError) {
    error!("Pacing stopped: {}", e);
    // Only the first fault matters; the channel holds one
    let _ = faults.try_send(e);
}

fn schedule_frame<S: PlaybackSink + ?Sized>(
    sink: &S,
    clock: &mut OutputClock,
    stats: &PacerStats,
    frame: Frame,
) -> Result<()> {
    let slot = clock.next_slot(&frame);
    let blank = frame.is_blank();
    if !blank {
        let waited = frame.captured_at().elapsed();
        metrics::histogram!("framerelay_capture_to_schedule_us").record(waited.as_micros() as f64);
    }

    // The sink takes over our handle
    sink.schedule(frame, slot)?;
    stats.record_scheduled(blank);
    Ok(())
}

/// Scheduling strategy selected by [`PacingMode`].
pub trait PacingStrategy: Send {
    /// Start scheduled playback. Called once input is streaming.
    fn start(&mut self, output: &Arc<dyn OutputDevice>) -> Result<()>;

    /// Stop scheduling and playback. No schedule call happens after this
    /// returns. Safe to call when not started.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

pub fn strategy_for(
    mode: PacingMode,
    source: Arc<dyn FrameSource>,
    settings: PacerSettings,
    stats: Arc<PacerStats>,
    faults: FaultSender,
) -> Box<dyn PacingStrategy> {
    match mode {
        PacingMode::FreeRunning => Box::new(FreeRunningSender::new(source, settings, stats, faults)),
        PacingMode::CompletionDriven => {
            Box::new(CompletionDriven::new(source, settings, stats, faults))
        }
    }
}

/// Body of the free-running sender: pop, stamp, schedule, until the source
/// is closed and drained. Returns the number of frames handed to the sink.
pub fn run_sender_loop<S: PlaybackSink + ?Sized>(
    source: &dyn FrameSource,
    sink: &S,
    clock: &mut OutputClock,
    stats: &PacerStats,
) -> Result<u64> {
    let mut sent = 0;
    while let Ok(frame) = source.pop_blocking() {
        schedule_frame(sink, clock, stats, frame)?;
        sent += 1;
    }
    Ok(sent)
}

/// Mode A: dedicated sender thread.
pub struct FreeRunningSender {
    source: Arc<dyn FrameSource>,
    settings: PacerSettings,
    stats: Arc<PacerStats>,
    faults: FaultSender,
    output: Option<Arc<dyn OutputDevice>>,
    thread: Option<JoinHandle<()>>,
}

impl FreeRunningSender {
    pub fn new(
        source: Arc<dyn FrameSource>,
        settings: PacerSettings,
        stats: Arc<PacerStats>,
        faults: FaultSender,
    ) -> Self {
        Self {
            source,
            settings,
            stats,
            faults,
            output: None,
            thread: None,
        }
    }

    fn spawn(&self, output: Arc<dyn OutputDevice>) -> std::io::Result<JoinHandle<()>> {
        let source = self.source.clone();
        let stats = self.stats.clone();
        let faults = self.faults.clone();
        let settings = self.settings;

        thread::Builder::new()
            .name("framerelay-sender".into())
            .spawn(move || {
                if let Some(core) = settings.sender_core {
                    pin_to_core(core);
                }

                let mut clock = OutputClock::new(
                    settings.timebase,
                    settings.output_latency_frames,
                    settings.timestamps,
                );

                match run_sender_loop(&*source, &*output, &mut clock, &stats) {
                    Ok(sent) => info!("Sender thread finished after {} frames", sent),
                    Err(e) => {
                        // Stop the producer side from piling up behind us
                        source.close();
                        report_fault(&faults, e);
                    }
                }
            })
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);

    if pinned {
        debug!("Sender thread pinned to core {}", core);
    } else {
        warn!("Could not pin sender thread to core {}", core);
    }
}

impl PacingStrategy for FreeRunningSender {
    fn start(&mut self, output: &Arc<dyn OutputDevice>) -> Result<()> {
        if self.thread.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        output.start_scheduled_playback(0, self.settings.timebase.time_scale())?;

        match self.spawn(output.clone()) {
            Ok(handle) => {
                self.thread = Some(handle);
                self.output = Some(output.clone());
                info!("Free-running sender started");
                Ok(())
            }
            Err(e) => {
                let _ = output.stop_scheduled_playback();
                Err(RelayError::device("spawn sender thread", e.to_string()))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        // Normally already closed by the relay; this is what ends the loop
        self.source.close();

        let joined = match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| RelayError::device("join sender thread", "sender thread panicked")),
            None => Ok(()),
        };

        let stopped = match self.output.take() {
            Some(output) => output.stop_scheduled_playback(),
            None => Ok(()),
        };

        joined.and(stopped)
    }

    fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Mode B core: reacts to each completed frame by scheduling the next one.
///
/// Holds only a weak reference to the sink, since the sink in turn holds this
/// pacer as its completion callback.
pub struct CompletionPacer<S: ?Sized> {
    source: Arc<dyn FrameSource>,
    sink: Weak<S>,
    blank: Frame,
    clock: Mutex<OutputClock>,
    running: AtomicBool,
    stats: Arc<PacerStats>,
    faults: FaultSender,
}

impl<S: PlaybackSink + ?Sized> CompletionPacer<S> {
    pub fn new(
        source: Arc<dyn FrameSource>,
        sink: Weak<S>,
        blank: Frame,
        clock: OutputClock,
        stats: Arc<PacerStats>,
        faults: FaultSender,
    ) -> Self {
        Self {
            source,
            sink,
            blank,
            clock: Mutex::new(clock),
            running: AtomicBool::new(true),
            stats,
            faults,
        }
    }

    fn clock(&self) -> MutexGuard<'_, OutputClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn blank_frame(&self) -> &Frame {
        &self.blank
    }

    /// Output slots consumed so far
    pub fn elapsed(&self) -> u64 {
        self.clock().elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop scheduling. Waits for an in-flight completion to finish, so no
    /// schedule call happens once this returns.
    pub fn halt(&self) {
        self.running.store(false, Ordering::Release);
        drop(self.clock());
    }

    /// Fill the device's buffer with `count` blank frames before playback starts.
    pub fn preroll(&self, count: u32) -> Result<()> {
        let mut clock = self.clock();
        for _ in 0..count {
            self.schedule(&mut clock, self.blank.clone())?;
        }
        debug!("Prerolled {} blank frames", count);
        Ok(())
    }

    fn schedule(&self, clock: &mut OutputClock, frame: Frame) -> Result<()> {
        let sink = self
            .sink
            .upgrade()
            .ok_or_else(|| RelayError::device("schedule frame", "output device is gone"))?;
        schedule_frame(&*sink, clock, &self.stats, frame)
    }

    /// Apply the pacing policy for one completion event.
    pub fn handle_completion(&self, status: CompletionStatus) -> Result<()> {
        self.stats.record_completion(status);

        if status == CompletionStatus::Flushed || !self.is_running() {
            return Ok(());
        }

        let mut clock = self.clock();
        if !self.is_running() {
            return Ok(());
        }

        if status == CompletionStatus::DisplayedLate {
            // Catch up by exactly one frame; more invites runaway skipping
            if self.source.count() > 1 {
                if let Ok(skipped) = self.source.pop_nonblocking() {
                    debug!("Skipping frame {} to resync", skipped.sequence());
                    self.stats.record_skip();
                }
            }
            clock.skip_slot();
        }

        let next = match self.source.pop_nonblocking() {
            Ok(frame) => frame,
            Err(TryPopError::Empty) => self.blank.clone(),
            Err(TryPopError::Closed) => {
                // Input has stopped; nothing more goes to the device
                debug!("Frame source closed, completion pacing stops");
                self.running.store(false, Ordering::Release);
                return Ok(());
            }
        };

        self.schedule(&mut clock, next)
    }
}

impl<S: PlaybackSink + ?Sized> PlaybackCallbacks for CompletionPacer<S> {
    fn on_scheduled_frame_completed(&self, frame: &Frame, status: CompletionStatus) {
        match status {
            CompletionStatus::DisplayedLate => {
                warn!("Frame {} was displayed late", frame.sequence())
            }
            CompletionStatus::Dropped => warn!("Frame {} was dropped", frame.sequence()),
            _ => {}
        }

        if let Err(e) = self.handle_completion(status) {
            self.running.store(false, Ordering::Release);
            report_fault(&self.faults, e);
        }
    }

    fn on_playback_stopped(&self) {
        debug!("Scheduled playback has stopped");
    }
}

/// Mode B: completion-driven pacing.
pub struct CompletionDriven {
    source: Arc<dyn FrameSource>,
    settings: PacerSettings,
    stats: Arc<PacerStats>,
    faults: FaultSender,
    active: Option<(Arc<CompletionPacer<dyn OutputDevice>>, Arc<dyn OutputDevice>)>,
}

impl CompletionDriven {
    pub fn new(
        source: Arc<dyn FrameSource>,
        settings: PacerSettings,
        stats: Arc<PacerStats>,
        faults: FaultSender,
    ) -> Self {
        Self {
            source,
            settings,
            stats,
            faults,
            active: None,
        }
    }

    fn clock(&self) -> OutputClock {
        // The counter timeline is covered by preroll; latency only shifts
        // capture timestamps.
        let latency = match self.settings.timestamps {
            TimestampSource::FrameCounter => 0,
            TimestampSource::Capture => self.settings.output_latency_frames,
        };
        OutputClock::new(self.settings.timebase, latency, self.settings.timestamps)
    }
}

impl PacingStrategy for CompletionDriven {
    fn start(&mut self, output: &Arc<dyn OutputDevice>) -> Result<()> {
        if self.active.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let blank = output.create_blank_frame(self.settings.width, self.settings.height)?;
        let pacer = Arc::new(CompletionPacer::new(
            self.source.clone(),
            Arc::downgrade(output),
            blank,
            self.clock(),
            self.stats.clone(),
            self.faults.clone(),
        ));

        output.set_completion_callback(Some(pacer.clone() as Arc<dyn PlaybackCallbacks>))?;

        let started = pacer.preroll(self.settings.preroll_frames).and_then(|_| {
            output.start_scheduled_playback(0, self.settings.timebase.time_scale())
        });

        if let Err(e) = started {
            pacer.halt();
            let _ = output.set_completion_callback(None);
            return Err(e);
        }

        info!(
            "Completion-driven playback started with {} preroll frames",
            self.settings.preroll_frames
        );
        self.active = Some((pacer, output.clone()));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some((pacer, output)) = self.active.take() else {
            return Ok(());
        };

        pacer.halt();
        let stopped = output.stop_scheduled_playback();
        let detached = output.set_completion_callback(None);
        stopped.and(detached)
    }

    fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|(pacer, _)| pacer.is_running())
    }
}
