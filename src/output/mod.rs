pub mod loopback;
pub mod sink;

pub use loopback::LoopbackDevice;
pub use sink::{CompletionStatus, OutputDevice, PlaybackCallbacks, PlaybackSink, ScheduledSlot};
