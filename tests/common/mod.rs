//! Scriptable devices for driving a relay from tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use framerelay::capture::{CaptureCallbacks, InputDevice, RawFrame};
use framerelay::output::{
    CompletionStatus, OutputDevice, PlaybackCallbacks, PlaybackSink, ScheduledSlot,
};
use framerelay::{Buffering, Config, Frame, FrameRate, PacingMode, PixelFormat, Result, VideoMode};

pub const WIDTH: u32 = 4;
pub const HEIGHT: u32 = 2;
/// 30000/1001 at the default 60000 time scale
pub const DURATION: i64 = 2002;

pub fn small_mode() -> VideoMode {
    VideoMode {
        name: "test 29.97".into(),
        width: WIDTH,
        height: HEIGHT,
        frame_rate: FrameRate::new(30000, 1001),
        pixel_format: PixelFormat::Bgra8,
    }
}

pub fn config(pacing: PacingMode, buffering: Buffering) -> Config {
    let mut config = Config::default();
    config.capture.mode = small_mode();
    config.capture.buffering = buffering;
    config.output.mode = small_mode();
    config.pipeline.pacing = pacing;
    config
}

/// Poll `condition` until it holds or a second has passed.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Input that only delivers frames when told to.
#[derive(Default)]
pub struct ScriptedInput {
    callback: Mutex<Option<Arc<dyn CaptureCallbacks>>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl ScriptedInput {
    /// Deliver one BGRA frame filled with `fill`, stamped at `index` frame durations.
    pub fn deliver(&self, fill: u8, index: i64) {
        let pixels = vec![fill; (WIDTH * HEIGHT * 4) as usize];
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback.on_frame_arrived(&RawFrame {
                width: WIDTH,
                height: HEIGHT,
                row_bytes: (WIDTH * 4) as usize,
                pixel_format: PixelFormat::Bgra8,
                data: &pixels,
                stream_time: Some(index * DURATION),
            });
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

impl InputDevice for ScriptedInput {
    fn set_callback(&self, callback: Option<Arc<dyn CaptureCallbacks>>) -> Result<()> {
        self.record(if callback.is_some() { "attach" } else { "detach" });
        *self.callback.lock().unwrap() = callback;
        Ok(())
    }

    fn enable_input(&self, _mode: &VideoMode) -> Result<()> {
        self.record("enable_input");
        Ok(())
    }

    fn start_streams(&self) -> Result<()> {
        self.record("start_streams");
        Ok(())
    }

    fn stop_streams(&self) -> Result<()> {
        self.record("stop_streams");
        Ok(())
    }

    fn disable_input(&self) -> Result<()> {
        self.record("disable_input");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub sequence: u64,
    pub blank: bool,
    pub presentation_time: i64,
}

/// Output that records every schedule call and completes frames on demand.
#[derive(Default)]
pub struct RecordingOutput {
    callback: Mutex<Option<Arc<dyn PlaybackCallbacks>>>,
    pending: Mutex<VecDeque<Frame>>,
    pub scheduled: Mutex<Vec<Scheduled>>,
    pub playing: Mutex<bool>,
}

impl RecordingOutput {
    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn live(&self) -> Vec<Scheduled> {
        self.scheduled().into_iter().filter(|s| !s.blank).collect()
    }

    /// Complete the oldest buffered frame with `status`, the way a device's
    /// playout thread would. Returns false when nothing is buffered.
    pub fn complete_next(&self, status: CompletionStatus) -> bool {
        let Some(frame) = self.pending.lock().unwrap().pop_front() else {
            return false;
        };
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback.on_scheduled_frame_completed(&frame, status);
        }
        true
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Frames still held by the device
    pub fn take_pending(&self) -> Vec<Frame> {
        self.pending.lock().unwrap().drain(..).collect()
    }
}

impl PlaybackSink for RecordingOutput {
    fn schedule(&self, frame: Frame, slot: ScheduledSlot) -> Result<()> {
        self.scheduled.lock().unwrap().push(Scheduled {
            sequence: frame.sequence(),
            blank: frame.is_blank(),
            presentation_time: slot.presentation_time,
        });
        self.pending.lock().unwrap().push_back(frame);
        Ok(())
    }
}

impl OutputDevice for RecordingOutput {
    fn set_completion_callback(&self, callback: Option<Arc<dyn PlaybackCallbacks>>) -> Result<()> {
        *self.callback.lock().unwrap() = callback;
        Ok(())
    }

    fn enable_output(&self, _mode: &VideoMode) -> Result<()> {
        Ok(())
    }

    fn start_scheduled_playback(&self, _start_time: i64, _time_scale: i64) -> Result<()> {
        *self.playing.lock().unwrap() = true;
        Ok(())
    }

    fn stop_scheduled_playback(&self) -> Result<()> {
        *self.playing.lock().unwrap() = false;
        Ok(())
    }

    fn disable_output(&self) -> Result<()> {
        Ok(())
    }

    fn buffered_frame_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
