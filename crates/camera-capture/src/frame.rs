//! Video frame types

use bytes::Bytes;
use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;

use crate::CaptureError;

/// One captured, JPEG-compressed frame
///
/// The payload is reference counted so the pre-trigger ring, the recording
/// queue and the segment recorder can share it without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    /// JPEG bytes
    pub data: Bytes,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Capture timestamp (milliseconds since the Unix epoch)
    pub timestamp_ms: u64,
    /// Frame sequence number
    pub sequence: u64,
}

impl Frame {
    /// Create a frame from already-compressed JPEG data
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, timestamp_ms: u64, sequence: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            timestamp_ms,
            sequence,
        }
    }

    /// Compress raw RGB24 pixels into a JPEG frame
    pub fn from_rgb(
        rgb: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: u64,
        sequence: u64,
    ) -> Result<Self, CaptureError> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, rgb)
            .ok_or_else(|| {
                CaptureError::Encode(format!("pixel buffer does not match {width}x{height} RGB"))
            })?;

        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Jpeg)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        Ok(Self::new(buffer.into_inner(), width, height, timestamp_ms, sequence))
    }

    /// Compressed payload size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_produces_jpeg() {
        let rgb = vec![128u8; 16 * 8 * 3];
        let frame = Frame::from_rgb(rgb, 16, 8, 1_000, 1).unwrap();
        assert!(!frame.is_empty());
        // JPEG start-of-image marker
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        assert_eq!(frame.width, 16);
        assert_eq!(frame.height, 8);
    }

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let result = Frame::from_rgb(vec![0u8; 10], 16, 8, 0, 0);
        assert!(matches!(result, Err(CaptureError::Encode(_))));
    }
}
