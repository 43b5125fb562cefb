//! Capture-side capabilities implemented by the device binding

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::frame::PixelFormat;
use crate::error::Result;
use crate::pipeline::clock::FrameRate;

/// Input video mode as reported or requested by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub pixel_format: PixelFormat,
}

impl VideoMode {
    /// The default the input is enabled with before format detection kicks in.
    pub fn ntsc() -> Self {
        Self {
            name: "NTSC".into(),
            width: 720,
            height: 486,
            frame_rate: FrameRate::new(30000, 1001),
            pixel_format: PixelFormat::Yuv10,
        }
    }

    pub fn hd1080i5994() -> Self {
        Self {
            name: "1080i59.94".into(),
            width: 1920,
            height: 1080,
            frame_rate: FrameRate::new(30000, 1001),
            pixel_format: PixelFormat::Bgra8,
        }
    }
}

/// One frame exactly as the device delivered it, borrowed for the duration
/// of the arrival callback.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub row_bytes: usize,
    pub pixel_format: PixelFormat,
    pub data: &'a [u8],
    /// Stream time in time-scale units
    pub stream_time: Option<i64>,
}

/// Callbacks invoked from the device's capture thread. Implementations must
/// return quickly: convert, publish, nothing else.
pub trait CaptureCallbacks: Send + Sync {
    fn on_frame_arrived(&self, frame: &RawFrame<'_>);

    /// The device detected a new input signal. The binding performs the
    /// pause/reconfigure/flush/resume sequence itself.
    fn on_format_changed(&self, mode: &VideoMode);
}

/// Control surface of a capture device
#[cfg_attr(test, mockall::automock)]
pub trait InputDevice: Send + Sync {
    fn set_callback(&self, callback: Option<Arc<dyn CaptureCallbacks>>) -> Result<()>;
    fn enable_input(&self, mode: &VideoMode) -> Result<()>;
    fn start_streams(&self) -> Result<()>;
    fn stop_streams(&self) -> Result<()>;
    fn disable_input(&self) -> Result<()>;
}
