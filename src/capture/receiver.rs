//! Capture callback: convert each arrival and hand it to the pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::convert::Converter;
use super::frame::FrameBuffer;
use super::shared::SharedFrameSlot;
use super::source::{CaptureCallbacks, RawFrame, VideoMode};
use crate::pipeline::queue::{FrameQueue, FrameSource};

/// Where converted frames go
#[derive(Clone)]
pub enum CaptureTarget {
    Queue(Arc<FrameQueue>),
    Slot(Arc<SharedFrameSlot>),
}

impl CaptureTarget {
    pub fn as_source(&self) -> Arc<dyn FrameSource> {
        match self {
            CaptureTarget::Queue(queue) => queue.clone(),
            CaptureTarget::Slot(slot) => slot.clone(),
        }
    }
}

#[derive(Default)]
struct CaptureStats {
    arrived: AtomicU64,
    published: AtomicU64,
    conversion_errors: AtomicU64,
    allocation_errors: AtomicU64,
    rejected: AtomicU64,
    format_changes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub arrived: u64,
    pub published: u64,
    pub conversion_errors: u64,
    pub allocation_errors: u64,
    /// Frames that arrived after the pipeline closed its source
    pub rejected: u64,
    pub format_changes: u64,
}

/// [`CaptureCallbacks`] implementation feeding a [`CaptureTarget`].
pub struct FrameReceiver {
    target: CaptureTarget,
    converter: Arc<dyn Converter>,
    log_every: u64,
    sequence: AtomicU64,
    current_mode: ArcSwapOption<VideoMode>,
    stats: CachePadded<CaptureStats>,
}

impl FrameReceiver {
    pub fn new(target: CaptureTarget, converter: Arc<dyn Converter>, log_every: u64) -> Self {
        Self {
            target,
            converter,
            log_every: log_every.max(1),
            sequence: AtomicU64::new(0),
            current_mode: ArcSwapOption::empty(),
            stats: CachePadded::new(CaptureStats::default()),
        }
    }

    /// Last mode reported by format detection, if any
    pub fn current_mode(&self) -> Option<Arc<VideoMode>> {
        self.current_mode.load_full()
    }

    pub fn stats(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            arrived: self.stats.arrived.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            conversion_errors: self.stats.conversion_errors.load(Ordering::Relaxed),
            allocation_errors: self.stats.allocation_errors.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            format_changes: self.stats.format_changes.load(Ordering::Relaxed),
        }
    }

    fn publish_to_queue(&self, queue: &FrameQueue, raw: &RawFrame<'_>, sequence: u64) {
        let mut buffer = match FrameBuffer::create(raw.width, raw.height) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.stats.allocation_errors.fetch_add(1, Ordering::Relaxed);
                error!("Dropping frame {}: {}", sequence, e);
                return;
            }
        };

        if let Err(e) = self.converter.convert(raw, &mut buffer) {
            self.conversion_failed(sequence, &e);
            return;
        }
        buffer.set_timestamp(raw.stream_time);

        if queue.push(buffer.publish(sequence)) {
            self.stats.published.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn publish_to_slot(&self, slot: &SharedFrameSlot, raw: &RawFrame<'_>, sequence: u64) {
        let written = slot.write_with(raw.width, raw.height, sequence, |buffer| {
            self.converter.convert(raw, buffer)?;
            buffer.set_timestamp(raw.stream_time);
            Ok(())
        });

        match written {
            Ok(true) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.conversion_failed(sequence, &e),
        }
    }

    fn conversion_failed(&self, sequence: u64, e: &crate::error::RelayError) {
        self.stats.conversion_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framerelay_conversion_errors_total").increment(1);
        if e.is_per_frame() {
            warn!("Dropping frame {}: {}", sequence, e);
        } else {
            error!("Dropping frame {}: {}", sequence, e);
        }
    }
}

impl CaptureCallbacks for FrameReceiver {
    fn on_frame_arrived(&self, raw: &RawFrame<'_>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let arrived = self.stats.arrived.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("framerelay_frames_captured_total").increment(1);

        if arrived % self.log_every == 0 {
            debug!(
                "w:{}, h:{}, fmt:{:?}, time:{:?}",
                raw.width, raw.height, raw.pixel_format, raw.stream_time
            );
        }

        match &self.target {
            CaptureTarget::Queue(queue) => self.publish_to_queue(queue, raw, sequence),
            CaptureTarget::Slot(slot) => self.publish_to_slot(slot, raw, sequence),
        }
    }

    fn on_format_changed(&self, mode: &VideoMode) {
        info!("Video input: {} ({}x{})", mode.name, mode.width, mode.height);
        self.stats.format_changes.fetch_add(1, Ordering::Relaxed);
        self.current_mode.store(Some(Arc::new(mode.clone())));
    }
}
