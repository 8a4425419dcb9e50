//! Pixel-level helpers shared by the detector, the clip codec and streaming.

use image::{
    GrayImage, ImageFormat, Luma, RgbImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use thiserror::Error;
use video_ingest::{Frame, FrameFormat};

/// Gaussian sigma matching a 7x7 kernel with automatic sigma.
pub const BLUR_SIGMA: f32 = 1.4;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame buffer does not match {width}x{height}")]
    Geometry { width: u32, height: u32 },
    #[error("image codec failure: {0}")]
    Codec(#[from] image::ImageError),
}

/// Borrow a frame as an RGB image, converting from BGR when needed.
pub fn to_rgb_image(frame: &Frame) -> Result<RgbImage, EncodeError> {
    let data = match frame.format {
        FrameFormat::Rgb8 => frame.data.clone(),
        FrameFormat::Bgr8 => frame.clone().into_rgb().data,
    };
    RgbImage::from_raw(frame.width, frame.height, data).ok_or(EncodeError::Geometry {
        width: frame.width,
        height: frame.height,
    })
}

pub fn frame_from_rgb(image: RgbImage, timestamp_ms: i64) -> Frame {
    let (width, height) = image.dimensions();
    Frame {
        data: image.into_raw(),
        width,
        height,
        timestamp_ms,
        format: FrameFormat::Rgb8,
    }
}

/// Resize to `width`, keeping the aspect ratio. Always returns RGB.
pub fn resize_to_width(frame: &Frame, width: u32) -> Result<Frame, EncodeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(EncodeError::Geometry {
            width: frame.width,
            height: frame.height,
        });
    }
    let rgb = to_rgb_image(frame)?;
    if frame.width == width {
        return Ok(frame_from_rgb(rgb, frame.timestamp_ms));
    }
    let height = ((frame.height as u64 * width as u64 + frame.width as u64 / 2)
        / frame.width as u64)
        .max(1) as u32;
    let resized = imageops::resize(&rgb, width, height, FilterType::Triangle);
    Ok(frame_from_rgb(resized, frame.timestamp_ms))
}

/// ITU-R BT.601 luma in integer arithmetic.
pub fn grayscale(frame: &Frame) -> GrayImage {
    let (r_idx, b_idx) = match frame.format {
        FrameFormat::Rgb8 => (0, 2),
        FrameFormat::Bgr8 => (2, 0),
    };
    let luma: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .map(|px| {
            let r = px[r_idx] as u32;
            let g = px[1] as u32;
            let b = px[b_idx] as u32;
            ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
        })
        .collect();
    GrayImage::from_raw(frame.width, frame.height, luma)
        .unwrap_or_else(|| GrayImage::from_pixel(frame.width, frame.height, Luma([0])))
}

/// Grayscale then blur: the image the background model works on.
pub fn detection_image(frame: &Frame) -> GrayImage {
    imageops::blur(&grayscale(frame), BLUR_SIGMA)
}

pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let rgb = to_rgb_image(frame)?;
    let mut buffer = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(buffer)
}

pub fn decode_jpeg(bytes: &[u8], timestamp_ms: i64) -> Result<Frame, EncodeError> {
    let rgb = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8();
    Ok(frame_from_rgb(rgb, timestamp_ms))
}
