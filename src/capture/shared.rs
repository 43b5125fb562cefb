//! Double-buffer capture variant: one reusable frame guarded by one mutex
//!
//! The capture callback converts straight into the shared buffer while
//! holding the lock; the consumer copies it out under the same lock and
//! schedules the copy after releasing it. Only the latest frame survives, so
//! a slow consumer sees skipped frames instead of a growing backlog.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam::utils::CachePadded;
use serde::Serialize;

use super::frame::{Frame, FrameBuffer};
use crate::error::Result;
use crate::pipeline::queue::{FrameSource, QueueClosed, TryPopError};

pub struct SharedFrameSlot {
    state: Mutex<SlotState>,
    fresh: Condvar,
    stats: CachePadded<SlotStats>,
}

struct SlotState {
    buffer: FrameBuffer,
    sequence: u64,
    fresh: bool,
    closed: bool,
}

#[derive(Default)]
struct SlotStats {
    written: AtomicUsize,
    overwritten: AtomicUsize,
    copied: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub written: usize,
    /// Frames replaced before the consumer copied them out
    pub overwritten: usize,
    pub copied: usize,
}

impl SharedFrameSlot {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(SlotState {
                buffer: FrameBuffer::create(width, height)?,
                sequence: 0,
                fresh: false,
                closed: false,
            }),
            fresh: Condvar::new(),
            stats: CachePadded::new(SlotStats::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture side: run `write` against the shared buffer under the lock.
    ///
    /// The buffer is reallocated first if the incoming size differs. Returns
    /// `Ok(false)` when the slot is closed. If `write` fails the slot holds no
    /// fresh frame until the next successful write.
    pub fn write_with<F>(&self, width: u32, height: u32, sequence: u64, write: F) -> Result<bool>
    where
        F: FnOnce(&mut FrameBuffer) -> Result<()>,
    {
        let mut state = self.lock();
        if state.closed {
            return Ok(false);
        }

        if state.buffer.width() != width || state.buffer.height() != height {
            state.buffer = FrameBuffer::create(width, height)?;
            state.fresh = false;
        }

        let replaced = state.fresh;
        state.fresh = false;
        write(&mut state.buffer)?;
        state.sequence = sequence;
        state.fresh = true;
        drop(state);

        self.fresh.notify_one();
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        Ok(true)
    }

    pub fn stats(&self) -> SlotSnapshot {
        SlotSnapshot {
            written: self.stats.written.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
            copied: self.stats.copied.load(Ordering::Relaxed),
        }
    }

    fn copy_out(&self, state: &mut SlotState) -> Frame {
        state.fresh = false;
        self.stats.copied.fetch_add(1, Ordering::Relaxed);
        state.buffer.snapshot(state.sequence)
    }
}

impl FrameSource for SharedFrameSlot {
    fn pop_blocking(&self) -> std::result::Result<Frame, QueueClosed> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(QueueClosed);
            }
            if state.fresh {
                return Ok(self.copy_out(&mut state));
            }
            state = self
                .fresh
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pop_nonblocking(&self) -> std::result::Result<Frame, TryPopError> {
        let mut state = self.lock();
        if state.closed {
            Err(TryPopError::Closed)
        } else if state.fresh {
            Ok(self.copy_out(&mut state))
        } else {
            Err(TryPopError::Empty)
        }
    }

    fn count(&self) -> usize {
        usize::from(self.lock().fresh)
    }

    fn close(&self) -> usize {
        let released = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::replace(&mut state.fresh, false)
        };
        self.fresh.notify_all();
        usize::from(released)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn fill(slot: &SharedFrameSlot, sequence: u64, value: u8) -> bool {
        slot.write_with(2, 2, sequence, |buffer| {
            buffer.bytes_mut().fill(value);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn consumer_gets_a_copy_of_the_latest_write() {
        let slot = SharedFrameSlot::new(2, 2).unwrap();
        assert_eq!(slot.pop_nonblocking().unwrap_err(), TryPopError::Empty);

        fill(&slot, 1, 0x11);
        fill(&slot, 2, 0x22);
        assert_eq!(slot.count(), 1);

        let frame = slot.pop_nonblocking().unwrap();
        assert_eq!(frame.sequence(), 2);
        assert!(frame.data().iter().all(|&b| b == 0x22));
        assert_eq!(slot.count(), 0);

        // The copy is independent of later writes
        fill(&slot, 3, 0x33);
        assert!(frame.data().iter().all(|&b| b == 0x22));
        assert_eq!(
            slot.stats(),
            SlotSnapshot {
                written: 3,
                overwritten: 1,
                copied: 1
            }
        );
    }

    #[test]
    fn failed_write_leaves_nothing_fresh() {
        let slot = SharedFrameSlot::new(2, 2).unwrap();
        let result = slot.write_with(2, 2, 1, |_| {
            Err(crate::error::RelayError::Conversion("bad".into()))
        });
        assert!(result.is_err());
        assert_eq!(slot.count(), 0);
    }

    #[test]
    fn resizes_on_new_dimensions() {
        let slot = SharedFrameSlot::new(2, 2).unwrap();
        slot.write_with(4, 1, 1, |_| Ok(())).unwrap();
        let frame = slot.pop_blocking().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 1));
    }

    #[test]
    fn close_wakes_blocked_consumer_and_rejects_writes() {
        let slot = Arc::new(SharedFrameSlot::new(2, 2).unwrap());
        let consumer = {
            let slot = slot.clone();
            thread::spawn(move || slot.pop_blocking().map(|f| f.sequence()))
        };

        thread::sleep(Duration::from_millis(50));
        slot.close();

        assert_eq!(consumer.join().unwrap(), Err(QueueClosed));
        assert!(!fill(&slot, 5, 0));
        assert_eq!(slot.pop_nonblocking().unwrap_err(), TryPopError::Closed);
    }
}
