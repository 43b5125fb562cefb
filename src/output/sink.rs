//! Playback-side capabilities implemented by the device binding

use serde::Serialize;
use std::sync::Arc;

use crate::capture::{Frame, VideoMode};
use crate::error::Result;
pub use crate::pipeline::clock::ScheduledSlot;

/// How a scheduled frame left the device's playout buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompletionStatus {
    OnTime,
    DisplayedLate,
    Dropped,
    /// Discarded because scheduled playback was stopped
    Flushed,
}

/// Accepts frames for display at a given time.
pub trait PlaybackSink: Send + Sync {
    /// Filler frame used for preroll and underrun.
    fn create_blank_frame(&self, width: u32, height: u32) -> Result<Frame> {
        Frame::blank(width, height)
    }

    /// Queue `frame` for display. The sink keeps its handle until the frame's
    /// completion has been reported.
    fn schedule(&self, frame: Frame, slot: ScheduledSlot) -> Result<()>;
}

/// Notifications raised on the device's playout thread.
pub trait PlaybackCallbacks: Send + Sync {
    fn on_scheduled_frame_completed(&self, frame: &Frame, status: CompletionStatus);

    fn on_playback_stopped(&self) {}
}

/// Control surface of a playback device
pub trait OutputDevice: PlaybackSink {
    fn set_completion_callback(&self, callback: Option<Arc<dyn PlaybackCallbacks>>) -> Result<()>;
    fn enable_output(&self, mode: &VideoMode) -> Result<()>;
    fn start_scheduled_playback(&self, start_time: i64, time_scale: i64) -> Result<()>;
    fn stop_scheduled_playback(&self) -> Result<()>;
    fn disable_output(&self) -> Result<()>;

    /// Frames scheduled but not yet completed
    fn buffered_frame_count(&self) -> usize;
}
