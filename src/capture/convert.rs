use super::frame::{FrameBuffer, PixelFormat};
use super::source::RawFrame;
use crate::error::{RelayError, Result};

/// Turns a raw device frame into BGRA pixels. Real conversions live in the
/// device binding; the pipeline treats this as a black box.
pub trait Converter: Send + Sync {
    fn convert(&self, raw: &RawFrame<'_>, destination: &mut FrameBuffer) -> Result<()>;
}

/// Copies frames that already arrive as 8-bit BGRA, honoring the source row
/// pitch. Anything else is a conversion error.
#[derive(Debug, Default, Clone, Copy)]
pub struct BgraPassthrough;

impl Converter for BgraPassthrough {
    fn convert(&self, raw: &RawFrame<'_>, destination: &mut FrameBuffer) -> Result<()> {
        if raw.pixel_format != PixelFormat::Bgra8 {
            return Err(RelayError::Conversion(format!(
                "unsupported source format: {:?}",
                raw.pixel_format
            )));
        }

        if raw.width != destination.width() || raw.height != destination.height() {
            return Err(RelayError::Conversion(format!(
                "size mismatch: source {}x{}, destination {}x{}",
                raw.width,
                raw.height,
                destination.width(),
                destination.height()
            )));
        }

        let row_len = destination.row_bytes();
        if raw.row_bytes < row_len {
            return Err(RelayError::Conversion(format!(
                "row pitch {} is shorter than {} bytes",
                raw.row_bytes, row_len
            )));
        }

        let rows = raw.height as usize;
        let needed = raw.row_bytes * (rows - 1) + row_len;
        if raw.data.len() < needed {
            return Err(RelayError::Conversion(format!(
                "truncated frame: {} bytes, need {}",
                raw.data.len(),
                needed
            )));
        }

        // Fast path: tightly packed
        if raw.row_bytes == row_len {
            return destination.write_from(&raw.data[..row_len * rows]);
        }

        for (dst, src) in destination
            .bytes_mut()
            .chunks_exact_mut(row_len)
            .zip(raw.data.chunks(raw.row_bytes))
        {
            dst.copy_from_slice(&src[..row_len]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(data: &[u8], width: u32, height: u32, row_bytes: usize) -> RawFrame<'_> {
        RawFrame {
            width,
            height,
            row_bytes,
            pixel_format: PixelFormat::Bgra8,
            data,
            stream_time: None,
        }
    }

    #[test]
    fn copies_packed_frame() {
        let src: Vec<u8> = (0..32).collect();
        let mut dst = FrameBuffer::create(4, 2).unwrap();
        BgraPassthrough.convert(&raw(&src, 4, 2, 16), &mut dst).unwrap();
        assert_eq!(dst.bytes(), &src[..]);
    }

    #[test]
    fn strips_row_padding() {
        // 1 pixel wide, 8 byte pitch: 4 bytes of pixel + 4 bytes of padding
        let src = [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8];
        let mut dst = FrameBuffer::create(1, 2).unwrap();
        BgraPassthrough.convert(&raw(&src, 1, 2, 8), &mut dst).unwrap();
        assert_eq!(dst.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn rejects_other_formats_and_short_input() {
        let src = [0u8; 16];
        let mut dst = FrameBuffer::create(2, 2).unwrap();

        let mut yuv = raw(&src, 2, 2, 8);
        yuv.pixel_format = PixelFormat::Yuv10;
        assert!(matches!(
            BgraPassthrough.convert(&yuv, &mut dst),
            Err(RelayError::Conversion(_))
        ));

        assert!(BgraPassthrough
            .convert(&raw(&src[..10], 2, 2, 8), &mut dst)
            .is_err());
    }
}
