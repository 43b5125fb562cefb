//! Output timeline arithmetic in exact (value, time_scale) units

use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::error::{RelayError, Result};

/// Ticks per second shared by capture and output.
pub const DEFAULT_TIME_SCALE: i64 = 60_000;

/// Frames per second as a rational, e.g. 30000/1001 for 29.97
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

/// How presentation times are derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampSource {
    /// Running output frame counter times the frame duration
    #[default]
    FrameCounter,
    /// The frame's own capture timestamp shifted by the output latency
    Capture,
}

/// Where and for how long a frame is shown, in `time_scale` units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub presentation_time: i64,
    pub duration: i64,
    pub time_scale: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    time_scale: i64,
    rate: FrameRate,
}

impl Timebase {
    pub fn new(time_scale: i64, rate: FrameRate) -> Result<Self> {
        if time_scale <= 0 {
            return Err(RelayError::InvalidConfig(format!(
                "time scale must be positive, got {time_scale}"
            )));
        }
        if rate.num == 0 || rate.den == 0 {
            return Err(RelayError::InvalidConfig(format!(
                "frame rate {}/{} has a zero term",
                rate.num, rate.den
            )));
        }
        Ok(Self { time_scale, rate })
    }

    pub fn time_scale(&self) -> i64 {
        self.time_scale
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.rate
    }

    /// Nominal duration of one output frame, rounded down.
    pub fn frame_duration(&self) -> i64 {
        self.time_for(1)
    }

    /// Start time of output slot `slot`. Computed from the slot index rather
    /// than by summing durations so fractional rates never accumulate error.
    pub fn time_for(&self, slot: u64) -> i64 {
        let ticks = slot as i128 * self.time_scale as i128 * self.rate.den as i128
            / self.rate.num as i128;
        i64::try_from(ticks).unwrap_or(i64::MAX)
    }
}

/// Running output timeline owned by a pacer.
#[derive(Debug, Clone)]
pub struct OutputClock {
    timebase: Timebase,
    latency_frames: u64,
    source: TimestampSource,
    slot: u64,
    last: Option<i64>,
}

impl OutputClock {
    pub fn new(timebase: Timebase, latency_frames: u32, source: TimestampSource) -> Self {
        Self {
            timebase,
            latency_frames: latency_frames as u64,
            source,
            slot: 0,
            last: None,
        }
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    /// Output slots consumed so far, scheduled or skipped
    pub fn elapsed(&self) -> u64 {
        self.slot
    }

    pub fn last_presentation_time(&self) -> Option<i64> {
        self.last
    }

    /// Compute the slot for `frame` and advance the counter by one.
    pub fn next_slot(&mut self, frame: &Frame) -> ScheduledSlot {
        let duration = self.timebase.frame_duration();
        let latency = self.latency_frames as i64 * duration;

        let candidate = match (self.source, frame.timestamp(), self.last) {
            (TimestampSource::Capture, Some(captured), _) => captured.saturating_add(latency),
            (TimestampSource::Capture, None, Some(previous)) => previous.saturating_add(duration),
            _ => self.timebase.time_for(self.slot + self.latency_frames),
        };

        // Capture timestamps can step backwards across a format change or a
        // flush; the output timeline must not.
        let presentation_time = match self.last {
            Some(previous) if candidate <= previous => previous.saturating_add(duration),
            _ => candidate,
        };

        self.slot += 1;
        self.last = Some(presentation_time);

        ScheduledSlot {
            presentation_time,
            duration,
            time_scale: self.timebase.time_scale,
        }
    }

    /// Give up one output slot without scheduling anything in it.
    pub fn skip_slot(&mut self) {
        self.slot += 1;
    }
}
