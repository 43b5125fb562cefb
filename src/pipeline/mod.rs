pub mod clock;
pub mod pacer;
pub mod queue;
pub mod relay;

pub use clock::{OutputClock, ScheduledSlot, Timebase};
pub use pacer::{
    run_sender_loop, CompletionDriven, CompletionPacer, FreeRunningSender, PacerSnapshot,
    PacerStats, PacingStrategy,
};
pub use queue::{FrameQueue, FrameSource, QueueClosed, QueueSnapshot, TryPopError};
