pub mod convert;
pub mod frame;
pub mod receiver;
pub mod shared;
pub mod source;

pub use convert::{BgraPassthrough, Converter};
pub use frame::{Frame, FrameBuffer, FrameFlags, PixelFormat};
pub use receiver::{CaptureSnapshot, CaptureTarget, FrameReceiver};
pub use shared::SharedFrameSlot;
pub use source::{CaptureCallbacks, InputDevice, RawFrame, VideoMode};
