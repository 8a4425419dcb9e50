use anyhow::Error;
use thiserror::Error;

/// Packed 8-bit colour frame captured from a video source.
///
/// Frames are plain owned buffers. Every stage that keeps a frame beyond the
/// current iteration clones it, so a consumer never sees a buffer the producer
/// is still writing into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Blue, green, red byte order as produced by OpenCV.
    Bgr8,
    /// Red, green, blue byte order as produced by ffmpeg `rgb24`.
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source ended")]
    EndOfStream,
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Other(#[from] Error),
}

impl Frame {
    /// Build a frame, checking that `data` matches the declared geometry.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: i64,
        format: FrameFormat,
    ) -> Result<Self, CaptureError> {
        let expected = (width as usize) * (height as usize) * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CaptureError::InvalidFrame {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
            format,
        })
    }

    /// Solid-colour frame, mostly useful for synthetic sources and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], timestamp_ms: i64) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Rgb8,
        }
    }

    /// Convert to packed RGB, reusing the buffer when it already is.
    pub fn into_rgb(self) -> Frame {
        match self.format {
            FrameFormat::Rgb8 => self,
            FrameFormat::Bgr8 => {
                let mut data = self.data;
                for chunk in data.chunks_exact_mut(3) {
                    chunk.swap(0, 2);
                }
                Frame {
                    data,
                    format: FrameFormat::Rgb8,
                    ..self
                }
            }
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_mismatched_buffer() {
        let err = Frame::new(vec![0; 10], 2, 2, 0, FrameFormat::Rgb8).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::InvalidFrame {
                expected: 12,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn bgr_converts_to_rgb() {
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, 7, FrameFormat::Bgr8).unwrap();
        let rgb = frame.into_rgb();
        assert_eq!(rgb.format, FrameFormat::Rgb8);
        assert_eq!(rgb.data, vec![3, 2, 1, 6, 5, 4]);
        assert_eq!(rgb.timestamp_ms, 7);
    }

    #[test]
    fn filled_frame_has_expected_geometry() {
        let frame = Frame::filled(4, 3, [9, 8, 7], 0);
        assert_eq!(frame.data.len(), 36);
        assert_eq!(&frame.data[..3], &[9, 8, 7]);
        assert_eq!(frame.pixel_count(), 12);
    }
}
