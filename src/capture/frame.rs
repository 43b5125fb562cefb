use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{RelayError, Result};

/// Every published frame is 8-bit BGRA.
pub const BYTES_PER_PIXEL: usize = 4;

/// Shared, immutable video frame.
///
/// Cloning acquires a reference and dropping releases it; the pixel buffer is
/// freed when the last holder lets go. Nothing can mutate the pixels once the
/// frame is published, so it can sit in a queue and in a device's playout
/// buffer at the same time.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

struct FrameInner {
    data: Bytes,
    meta: FrameMetadata,
    captured_at: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Stream time in time-scale units, when the source provided one
    pub timestamp: Option<i64>,
    pub flags: FrameFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const DEFAULT: Self = Self(0);
    /// Filler frame used for preroll and underrun
    pub const BLANK: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Pixel formats a capture device can hand us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra8,
    Argb8,
    Yuv8,
    Yuv10,
    Rgb10,
}

impl PixelFormat {
    /// Minimum row length in bytes, for formats with a fixed pixel size
    pub fn min_row_bytes(self, width: u32) -> Option<usize> {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Argb8 => Some(width as usize * 4),
            PixelFormat::Yuv8 => Some(width as usize * 2),
            PixelFormat::Yuv10 | PixelFormat::Rgb10 => None,
        }
    }
}

impl Frame {
    /// Zeroed frame flagged as blank filler.
    pub fn blank(width: u32, height: u32) -> Result<Self> {
        let mut buffer = FrameBuffer::create(width, height)?;
        buffer.set_flags(FrameFlags::BLANK);
        Ok(buffer.publish(0))
    }

    pub fn width(&self) -> u32 {
        self.inner.meta.width
    }

    pub fn height(&self) -> u32 {
        self.inner.meta.height
    }

    pub fn row_bytes(&self) -> usize {
        self.inner.meta.stride as usize
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.inner.meta
    }

    pub fn sequence(&self) -> u64 {
        self.inner.meta.sequence
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.inner.meta.timestamp
    }

    pub fn flags(&self) -> FrameFlags {
        self.inner.meta.flags
    }

    pub fn is_blank(&self) -> bool {
        self.flags().contains(FrameFlags::BLANK)
    }

    /// Wall-clock instant the frame was published, for latency tracking
    pub fn captured_at(&self) -> Instant {
        self.inner.captured_at
    }

    /// Number of live handles to this frame.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles refer to the same published frame.
    pub fn ptr_eq(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("timestamp", &self.timestamp())
            .field("blank", &self.is_blank())
            .finish()
    }
}

/// Exclusively owned frame under construction.
///
/// Converters write into it; [`FrameBuffer::publish`] turns it into a shared
/// [`Frame`] and ends mutability.
pub struct FrameBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
    timestamp: Option<i64>,
    flags: FrameFlags,
}

impl FrameBuffer {
    /// Allocate a zeroed `width` x `height` BGRA buffer.
    pub fn create(width: u32, height: u32) -> Result<Self> {
        let alloc_error = || RelayError::Allocation { width, height };

        if width == 0 || height == 0 {
            return Err(alloc_error());
        }

        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .ok_or_else(alloc_error)?;

        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| alloc_error())?;
        data.resize(len, 0);

        Ok(Self {
            data,
            width,
            height,
            timestamp: None,
            flags: FrameFlags::DEFAULT,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy already converted pixels into the buffer.
    pub fn write_from(&mut self, source: &[u8]) -> Result<()> {
        if source.len() != self.data.len() {
            return Err(RelayError::BufferSize {
                expected: self.data.len(),
                actual: source.len(),
            });
        }
        self.data.copy_from_slice(source);
        Ok(())
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.timestamp = timestamp;
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags;
    }

    /// Freeze the buffer into a shareable frame.
    pub fn publish(self, sequence: u64) -> Frame {
        let meta = self.metadata(sequence);
        Frame::from_parts(Bytes::from(self.data), meta)
    }

    /// Publish a copy of the current contents and keep the buffer for reuse.
    pub fn snapshot(&self, sequence: u64) -> Frame {
        Frame::from_parts(Bytes::copy_from_slice(&self.data), self.metadata(sequence))
    }

    fn metadata(&self, sequence: u64) -> FrameMetadata {
        FrameMetadata {
            sequence,
            width: self.width,
            height: self.height,
            stride: self.width * BYTES_PER_PIXEL as u32,
            timestamp: self.timestamp,
            flags: self.flags,
        }
    }
}

impl Frame {
    fn from_parts(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                data,
                meta,
                captured_at: Instant::now(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_allocates_zeroed_bgra() {
        let buffer = FrameBuffer::create(4, 3).unwrap();
        assert_eq!(buffer.len(), 4 * 3 * BYTES_PER_PIXEL);
        assert_eq!(buffer.row_bytes(), 16);
        assert!(buffer.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn create_rejects_zero_and_overflowing_sizes() {
        assert!(matches!(
            FrameBuffer::create(0, 1080),
            Err(RelayError::Allocation { width: 0, .. })
        ));
        assert!(matches!(
            FrameBuffer::create(u32::MAX, u32::MAX),
            Err(RelayError::Allocation { .. })
        ));
    }

    #[test]
    fn write_from_checks_length() {
        let mut buffer = FrameBuffer::create(2, 2).unwrap();
        let err = buffer.write_from(&[1u8; 3]).unwrap_err();
        assert!(matches!(
            err,
            RelayError::BufferSize {
                expected: 16,
                actual: 3
            }
        ));

        buffer.write_from(&[7u8; 16]).unwrap();
        assert!(buffer.bytes().iter().all(|&b| b == 7));
    }

    #[test]
    fn publish_carries_metadata() {
        let mut buffer = FrameBuffer::create(8, 2).unwrap();
        buffer.set_timestamp(Some(2002));
        let frame = buffer.publish(42);

        assert_eq!(frame.sequence(), 42);
        assert_eq!(frame.timestamp(), Some(2002));
        assert_eq!(frame.row_bytes(), 32);
        assert_eq!(frame.data().len(), 64);
        assert!(!frame.is_blank());
    }

    #[test]
    fn clone_and_drop_track_references() {
        let frame = Frame::blank(2, 2).unwrap();
        assert!(frame.is_blank());
        assert_eq!(frame.ref_count(), 1);

        let held = frame.clone();
        assert_eq!(frame.ref_count(), 2);
        assert!(held.ptr_eq(&frame));

        let handle = std::thread::spawn(move || drop(held));
        handle.join().unwrap();
        assert_eq!(frame.ref_count(), 1);
    }

    #[test]
    fn flags_compose() {
        let flags = FrameFlags::DEFAULT.union(FrameFlags::BLANK);
        assert!(flags.contains(FrameFlags::BLANK));
        assert!(!FrameFlags::DEFAULT.contains(FrameFlags::BLANK));
    }
}
