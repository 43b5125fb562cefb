//! Unbounded FIFO frame queue between the capture callback and the pacer

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use serde::Serialize;
use thiserror::Error;

use crate::capture::Frame;
use crate::error::RelayError;

/// The source was closed and holds nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame source is closed")]
pub struct QueueClosed;

impl From<QueueClosed> for RelayError {
    fn from(_: QueueClosed) -> Self {
        RelayError::QueueClosed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryPopError {
    #[error("no frame available")]
    Empty,
    #[error("frame source is closed")]
    Closed,
}

/// Where pacers pull frames from: either the [`FrameQueue`] or the
/// double-buffered [`SharedFrameSlot`](crate::capture::SharedFrameSlot).
pub trait FrameSource: Send + Sync {
    /// Wait until a frame is available or the source is closed.
    fn pop_blocking(&self) -> Result<Frame, QueueClosed>;

    /// Never waits; safe to call from a real-time device callback.
    fn pop_nonblocking(&self) -> Result<Frame, TryPopError>;

    /// Snapshot of frames waiting. May be stale as soon as it returns.
    fn count(&self) -> usize;

    /// Stop accepting frames, release what is held and wake every waiter.
    /// Returns the number of frames released.
    fn close(&self) -> usize;

    fn is_closed(&self) -> bool;
}

/// Thread-safe FIFO of frames.
///
/// There is no capacity cap: if the consumer stalls, the queue grows. The
/// high-water mark in [`QueueSnapshot`] makes that visible.
///
/// Pushing after [`close`](FrameSource::close) releases the frame immediately
/// and returns `false`.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_rejected: AtomicUsize,
    frames_released_on_close: AtomicUsize,
    high_water: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pushed: usize,
    pub popped: usize,
    pub rejected: usize,
    pub released_on_close: usize,
    pub high_water: usize,
    pub depth: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: append a frame. Returns `false` if the queue is closed, in
    /// which case the frame has already been released.
    pub fn push(&self, frame: Frame) -> bool {
        let depth = {
            let mut state = self.lock();
            if state.closed {
                drop(state);
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            state.frames.push_back(frame);
            state.frames.len()
        };

        self.available.notify_one();
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        self.stats.high_water.fetch_max(depth, Ordering::Relaxed);
        metrics::gauge!("framerelay_queue_depth").set(depth as f64);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueSnapshot {
        QueueSnapshot {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
            released_on_close: self.stats.frames_released_on_close.load(Ordering::Relaxed),
            high_water: self.stats.high_water.load(Ordering::Relaxed),
            depth: self.len(),
        }
    }

    fn popped(&self, frame: Frame) -> Frame {
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        frame
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FrameQueue {
    fn pop_blocking(&self) -> Result<Frame, QueueClosed> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                drop(state);
                return Ok(self.popped(frame));
            }
            if state.closed {
                return Err(QueueClosed);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pop_nonblocking(&self) -> Result<Frame, TryPopError> {
        let mut state = self.lock();
        match state.frames.pop_front() {
            Some(frame) => {
                drop(state);
                Ok(self.popped(frame))
            }
            None if state.closed => Err(TryPopError::Closed),
            None => Err(TryPopError::Empty),
        }
    }

    fn count(&self) -> usize {
        self.len()
    }

    fn close(&self) -> usize {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.frames)
        };
        self.available.notify_all();

        // Release outside the lock
        let released = drained.len();
        drop(drained);

        self.stats
            .frames_released_on_close
            .fetch_add(released, Ordering::Relaxed);
        metrics::gauge!("framerelay_queue_depth").set(0.0);
        released
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
