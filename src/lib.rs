pub mod capture;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod utils;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameBuffer, PixelFormat, VideoMode};
pub use error::{RelayError, Result};
pub use pipeline::clock::{FrameRate, Timebase, TimestampSource, DEFAULT_TIME_SCALE};
pub use pipeline::pacer::{PacerSettings, PacingMode};
pub use pipeline::relay::{Relay, RelayState, RelayStats};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    pub loopback: LoopbackConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Mode the input is enabled with before format detection takes over
    pub mode: VideoMode,
    pub buffering: Buffering,
    pub log_every_n_frames: u64,
}

/// How captured frames are held until the pacer takes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Buffering {
    /// Unbounded FIFO, every frame is kept
    Queue,
    /// Single shared frame, only the latest survives
    SharedSlot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub mode: VideoMode,
    pub time_scale: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pacing: PacingMode,
    pub timestamps: TimestampSource,
    /// Fixed delay, in output frames, absorbing end-to-end pipeline latency
    pub output_latency_frames: u32,
    /// Blank frames scheduled before playback starts
    pub preroll_frames: u32,
    pub sender_core: Option<usize>,
}

/// A skew at or below this stops the loopback input clock entirely
pub const MIN_CLOCK_SKEW_PPM: i32 = -1_000_000;

/// Settings of the built-in loopback device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Capture clock error relative to the output clock, in parts per million
    pub clock_skew_ppm: i32,
    /// Stop after this many seconds; run until interrupted when unset
    pub run_seconds: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                mode: VideoMode::hd1080i5994(),
                buffering: Buffering::Queue,
                log_every_n_frames: 15,
            },
            output: OutputConfig {
                mode: VideoMode::hd1080i5994(),
                time_scale: DEFAULT_TIME_SCALE,
            },
            pipeline: PipelineConfig {
                pacing: PacingMode::CompletionDriven,
                timestamps: TimestampSource::FrameCounter,
                output_latency_frames: 3,
                preroll_frames: 3,
                sender_core: None,
            },
            loopback: LoopbackConfig {
                clock_skew_ppm: 0,
                run_seconds: None,
            },
        }
    }
}

impl Config {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (what, mode) in [("capture", &self.capture.mode), ("output", &self.output.mode)] {
            if mode.width == 0 || mode.height == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "{what} mode {} has a zero dimension",
                    mode.name
                )));
            }
            Timebase::new(self.output.time_scale, mode.frame_rate)?;
        }
        if self.loopback.clock_skew_ppm <= MIN_CLOCK_SKEW_PPM {
            return Err(RelayError::InvalidConfig(format!(
                "loopback clock skew must be above {MIN_CLOCK_SKEW_PPM} ppm, got {}",
                self.loopback.clock_skew_ppm
            )));
        }
        Ok(())
    }

    pub fn timebase(&self) -> Result<Timebase> {
        Timebase::new(self.output.time_scale, self.output.mode.frame_rate)
    }

    pub fn pacer_settings(&self) -> Result<PacerSettings> {
        self.validate()?;
        Ok(PacerSettings {
            timebase: self.timebase()?,
            width: self.output.mode.width,
            height: self.output.mode.height,
            output_latency_frames: self.pipeline.output_latency_frames,
            preroll_frames: self.pipeline.preroll_frames,
            timestamps: self.pipeline.timestamps,
            sender_core: self.pipeline.sender_core,
        })
    }
}
