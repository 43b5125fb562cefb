//! Lifecycle controller: brings capture and playback up in order and tears
//! them down in reverse

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::pacer::{strategy_for, FaultSender, PacerSnapshot, PacerStats, PacingStrategy};
use super::queue::{FrameQueue, FrameSource};
use crate::capture::{
    CaptureCallbacks, CaptureSnapshot, CaptureTarget, Converter, FrameReceiver, InputDevice,
    SharedFrameSlot,
};
use crate::error::{RelayError, Result};
use crate::output::OutputDevice;
use crate::{Buffering, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelayState {
    Idle,
    /// Input is streaming, playback not yet started
    Capturing,
    Streaming,
    /// Shutdown in progress
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub state: RelayState,
    pub capture: CaptureSnapshot,
    pub pacer: PacerSnapshot,
    pub queue_depth: usize,
}

/// Start steps that need undoing if a later one fails
#[derive(Debug, Clone, Copy)]
enum StartStep {
    CallbackAttached,
    InputEnabled,
    OutputEnabled,
    InputStreaming,
}

struct Session {
    source: Arc<dyn FrameSource>,
    receiver: Arc<FrameReceiver>,
    stats: Arc<PacerStats>,
    /// `None` once the session has been stopped
    strategy: Option<Box<dyn PacingStrategy>>,
}

/// Relays frames from an input device to an output device.
pub struct Relay {
    config: Config,
    input: Arc<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    converter: Arc<dyn Converter>,
    state: RelayState,
    session: Option<Session>,
    fault_tx: FaultSender,
    fault_rx: flume::Receiver<RelayError>,
}

impl Relay {
    pub fn new(
        config: Config,
        input: Arc<dyn InputDevice>,
        output: Arc<dyn OutputDevice>,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        config.validate()?;
        let (fault_tx, fault_rx) = flume::bounded(1);

        Ok(Self {
            config,
            input,
            output,
            converter,
            state: RelayState::Idle,
            session: None,
            fault_tx,
            fault_rx,
        })
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fatal errors raised by the pacer while streaming. The relay keeps
    /// running after a fault until [`stop`](Self::stop) is called.
    pub fn faults(&self) -> flume::Receiver<RelayError> {
        self.fault_rx.clone()
    }

    /// Frame source of the current or most recent session
    pub fn frame_source(&self) -> Option<Arc<dyn FrameSource>> {
        self.session.as_ref().map(|s| s.source.clone())
    }

    /// Whether a pacing thread or callback is still scheduling frames
    pub fn is_pacing(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|s| s.strategy.as_ref())
            .is_some_and(|strategy| strategy.is_running())
    }

    pub fn stats(&self) -> RelayStats {
        match &self.session {
            Some(session) => RelayStats {
                state: self.state,
                capture: session.receiver.stats(),
                pacer: session.stats.snapshot(),
                queue_depth: session.source.count(),
            },
            None => RelayStats {
                state: self.state,
                capture: CaptureSnapshot::default(),
                pacer: PacerSnapshot::default(),
                queue_depth: 0,
            },
        }
    }

    /// Start capturing and relaying. On failure every step already taken is
    /// undone and the relay is back to [`RelayState::Idle`].
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<()> {
        if self.state != RelayState::Idle {
            return Err(RelayError::AlreadyRunning);
        }

        let settings = self.config.pacer_settings()?;
        let target = match self.config.capture.buffering {
            Buffering::Queue => CaptureTarget::Queue(Arc::new(FrameQueue::new())),
            Buffering::SharedSlot => {
                let mode = &self.config.capture.mode;
                CaptureTarget::Slot(Arc::new(SharedFrameSlot::new(mode.width, mode.height)?))
            }
        };
        let source = target.as_source();
        let receiver = Arc::new(FrameReceiver::new(
            target,
            self.converter.clone(),
            self.config.capture.log_every_n_frames,
        ));
        let stats = Arc::new(PacerStats::new());

        // Faults from a previous session are stale
        while self.fault_rx.try_recv().is_ok() {}

        let mut strategy = strategy_for(
            self.config.pipeline.pacing,
            source.clone(),
            settings,
            stats.clone(),
            self.fault_tx.clone(),
        );

        let mut done = Vec::new();
        if let Err(e) = self.bring_up(&receiver, strategy.as_mut(), &mut done) {
            error!("Start failed: {}", e);
            source.close();
            self.unwind(&done);
            self.state = RelayState::Idle;
            return Err(e);
        }

        self.session = Some(Session {
            source,
            receiver,
            stats,
            strategy: Some(strategy),
        });
        self.state = RelayState::Streaming;
        info!("Relay streaming ({:?})", self.config.pipeline.pacing);
        Ok(())
    }

    fn bring_up(
        &mut self,
        receiver: &Arc<FrameReceiver>,
        strategy: &mut dyn PacingStrategy,
        done: &mut Vec<StartStep>,
    ) -> Result<()> {
        self.input
            .set_callback(Some(receiver.clone() as Arc<dyn CaptureCallbacks>))?;
        done.push(StartStep::CallbackAttached);

        self.input.enable_input(&self.config.capture.mode)?;
        done.push(StartStep::InputEnabled);

        self.output.enable_output(&self.config.output.mode)?;
        done.push(StartStep::OutputEnabled);

        self.input.start_streams()?;
        done.push(StartStep::InputStreaming);
        self.state = RelayState::Capturing;

        // Cleans up after itself on failure
        strategy.start(&self.output)
    }

    fn unwind(&self, done: &[StartStep]) {
        for step in done.iter().rev() {
            let result = match step {
                StartStep::InputStreaming => self.input.stop_streams(),
                StartStep::OutputEnabled => self.output.disable_output(),
                StartStep::InputEnabled => self.input.disable_input(),
                StartStep::CallbackAttached => self.input.set_callback(None),
            };
            if let Err(e) = result {
                warn!("Rollback of {:?} failed: {}", step, e);
            }
        }
    }

    /// Stop relaying. Teardown always runs to completion; the first error
    /// met along the way is returned. Stopping an idle relay returns
    /// [`RelayError::AlreadyStopped`] and does nothing.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut strategy) = self
            .session
            .as_mut()
            .and_then(|session| session.strategy.take())
        else {
            return Err(RelayError::AlreadyStopped);
        };
        self.state = RelayState::Draining;

        let mut first_error = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("{} failed during stop: {}", step, e);
                first_error.get_or_insert(e);
            }
        };

        // No more producer activity from here on
        note("stop input streams", self.input.stop_streams());

        if let Some(session) = &self.session {
            let released = session.source.close();
            info!("Released {} queued frames", released);
        }

        note("stop pacing", strategy.stop());
        note("disable input", self.input.disable_input());
        note("disable output", self.output.disable_output());
        note("detach capture callback", self.input.set_callback(None));

        self.state = RelayState::Idle;
        info!("Relay stopped: {:?}", self.stats().pacer);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.state != RelayState::Idle {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::MockInputDevice;
    use crate::capture::{BgraPassthrough, Frame, VideoMode};
    use crate::output::{PlaybackCallbacks, PlaybackSink, ScheduledSlot};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeOutput {
        fail_enable: AtomicBool,
        fail_start: AtomicBool,
        enabled: AtomicBool,
        playing: AtomicBool,
        scheduled: AtomicUsize,
        callback: Mutex<Option<Arc<dyn PlaybackCallbacks>>>,
    }

    impl PlaybackSink for FakeOutput {
        fn schedule(&self, _frame: Frame, _slot: ScheduledSlot) -> Result<()> {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl OutputDevice for FakeOutput {
        fn set_completion_callback(
            &self,
            callback: Option<Arc<dyn PlaybackCallbacks>>,
        ) -> Result<()> {
            *self.callback.lock().unwrap() = callback;
            Ok(())
        }

        fn enable_output(&self, _mode: &VideoMode) -> Result<()> {
            if self.fail_enable.load(Ordering::SeqCst) {
                return Err(RelayError::device("enable output", "no signal"));
            }
            self.enabled.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn start_scheduled_playback(&self, _start_time: i64, _time_scale: i64) -> Result<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(RelayError::device("start playback", "busy"));
            }
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop_scheduled_playback(&self) -> Result<()> {
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn disable_output(&self) -> Result<()> {
            self.enabled.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn buffered_frame_count(&self) -> usize {
            0
        }
    }

    fn relay(input: MockInputDevice, output: Arc<FakeOutput>) -> Relay {
        let mut config = Config::default();
        config.output.mode.width = 16;
        config.output.mode.height = 8;
        Relay::new(config, Arc::new(input), output, Arc::new(BgraPassthrough)).unwrap()
    }

    #[test]
    fn failed_output_enable_rolls_back_input() {
        let mut input = MockInputDevice::new();
        input.expect_set_callback().times(2).returning(|_| Ok(()));
        input.expect_enable_input().times(1).returning(|_| Ok(()));
        input.expect_disable_input().times(1).returning(|| Ok(()));
        input.expect_start_streams().never();
        input.expect_stop_streams().never();

        let output = Arc::new(FakeOutput::default());
        output.fail_enable.store(true, Ordering::SeqCst);
        let mut relay = relay(input, output.clone());

        assert!(matches!(relay.start(), Err(RelayError::Device { .. })));
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(relay.frame_source().is_none());
    }

    #[test]
    fn failed_playback_start_unwinds_every_step() {
        let mut input = MockInputDevice::new();
        input.expect_set_callback().times(2).returning(|_| Ok(()));
        input.expect_enable_input().times(1).returning(|_| Ok(()));
        input.expect_start_streams().times(1).returning(|| Ok(()));
        input.expect_stop_streams().times(1).returning(|| Ok(()));
        input.expect_disable_input().times(1).returning(|| Ok(()));

        let output = Arc::new(FakeOutput::default());
        output.fail_start.store(true, Ordering::SeqCst);
        let mut relay = relay(input, output.clone());

        assert!(relay.start().is_err());
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(!output.enabled.load(Ordering::SeqCst));
        assert!(output.callback.lock().unwrap().is_none());
    }

    #[test]
    fn start_then_double_stop() {
        let mut input = MockInputDevice::new();
        input.expect_set_callback().times(2).returning(|_| Ok(()));
        input.expect_enable_input().times(1).returning(|_| Ok(()));
        input.expect_start_streams().times(1).returning(|| Ok(()));
        input.expect_stop_streams().times(1).returning(|| Ok(()));
        input.expect_disable_input().times(1).returning(|| Ok(()));

        let output = Arc::new(FakeOutput::default());
        let mut relay = relay(input, output.clone());

        relay.start().unwrap();
        assert_eq!(relay.state(), RelayState::Streaming);
        assert!(matches!(relay.start(), Err(RelayError::AlreadyRunning)));
        assert!(output.playing.load(Ordering::SeqCst));
        // Preroll went out before playback started
        assert_eq!(output.scheduled.load(Ordering::SeqCst), 3);

        relay.stop().unwrap();
        assert_eq!(relay.state(), RelayState::Idle);
        assert!(!output.playing.load(Ordering::SeqCst));
        assert!(relay.frame_source().unwrap().is_closed());
        assert!(matches!(relay.stop(), Err(RelayError::AlreadyStopped)));
    }

    #[test]
    fn stop_before_start_is_already_stopped() {
        let input = MockInputDevice::new();
        let mut relay = relay(input, Arc::new(FakeOutput::default()));
        assert!(matches!(relay.stop(), Err(RelayError::AlreadyStopped)));
    }
}
