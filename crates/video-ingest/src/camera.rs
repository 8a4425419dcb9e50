//! OpenCV-backed camera capture, enabled with the `opencv` feature.

use std::thread;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    source::parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

/// Spawn a background thread that captures native-resolution BGR frames from
/// `uri`. The channel is small so a stalled pipeline backpressures capture.
pub fn spawn_camera_reader(
    uri: &str,
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (tx, rx) = bounded(2);
    let mut cap = open_video_capture(uri)?;
    configure_camera(&mut cap);

    thread::Builder::new()
        .name("opencv-capture".into())
        .spawn(move || {
            if let Err(err) = capture_loop(cap, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn capture_loop(
    mut cap: VideoCapture,
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut mat = Mat::default();

    loop {
        let grabbed = cap
            .read(&mut mat)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::EndOfStream);
        }

        let size = mat.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            continue;
        }

        let data = mat
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        let frame = Frame::new(
            data,
            size.width as u32,
            size.height as u32,
            Utc::now().timestamp_millis(),
            FrameFormat::Bgr8,
        )?;

        if tx.send(Ok(frame)).is_err() {
            debug!("capture receiver dropped; releasing camera");
            break;
        }
    }

    let _ = cap.release();
    Ok(())
}

/// Attempt to open a camera either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    match VideoCapture::from_file(uri, videoio::CAP_ANY) {
        Ok(cap) if cap.is_opened().unwrap_or(false) => Ok(cap),
        Ok(_) => Err(CaptureError::Open {
            uri: uri.to_string(),
        }),
        Err(err) => {
            warn!("failed to open {uri}: {err}");
            Err(CaptureError::Open {
                uri: uri.to_string(),
            })
        }
    }
}

/// Prefer MJPG from UVC cameras; fall back to YUYV.
fn configure_camera(cap: &mut VideoCapture) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
}
