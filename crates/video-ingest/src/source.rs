//! The `FrameSource` boundary the pipeline pulls frames from.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::types::{CaptureError, Frame};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L2 devices addressed by index or `/dev/videoN`.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// Pre-recorded video files replayed at their native rate.
    File,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if parse_device_index(uri).is_some() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

/// Producer of raw frames, typically a camera.
pub trait FrameSource: Send {
    /// Block for up to `timeout` waiting for the next frame. `Ok(None)` means
    /// nothing arrived in time and the caller may poll again.
    fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying device. Further reads fail.
    fn stop(&mut self);
}

/// Source fed by a capture thread through a bounded channel.
///
/// Dropping the receiver is the stop signal: the capture thread notices the
/// closed channel on its next send and tears the device down.
pub struct ChannelSource {
    rx: Option<Receiver<Result<Frame, CaptureError>>>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Result<Frame, CaptureError>>) -> Self {
        Self { rx: Some(rx) }
    }
}

impl FrameSource for ChannelSource {
    fn read(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError> {
        let rx = self.rx.as_ref().ok_or(CaptureError::EndOfStream)?;
        match rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream),
        }
    }

    fn stop(&mut self) {
        if self.rx.take().is_some() {
            debug!("frame source stopped");
        }
    }
}

/// Open `uri` using the transport implied by its shape.
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
    let rx = match SourceKind::from_uri(uri) {
        SourceKind::Rtsp => crate::ffmpeg::spawn_rtsp_reader(uri)?,
        SourceKind::File => crate::ffmpeg::spawn_file_reader(uri)?,
        SourceKind::Device => open_device(uri)?,
    };
    Ok(Box::new(ChannelSource::new(rx)))
}

#[cfg(feature = "opencv")]
fn open_device(uri: &str) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    crate::camera::spawn_camera_reader(uri)
}

#[cfg(not(feature = "opencv"))]
fn open_device(uri: &str) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    crate::ffmpeg::spawn_device_reader(uri)
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;

    #[test]
    fn source_kind_from_uri() {
        assert_eq!(SourceKind::from_uri("0"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("/dev/video2"), SourceKind::Device);
        assert_eq!(SourceKind::from_uri("rtsp://cam/live"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("rtsps://cam/live"), SourceKind::Rtsp);
        assert_eq!(SourceKind::from_uri("clips/porch.mp4"), SourceKind::File);
    }

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("3"), Some(3));
        assert_eq!(parse_device_index("/dev/video1"), Some(1));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("/dev/videox"), None);
    }

    #[test]
    fn channel_source_reports_timeout_frames_and_end() {
        let (tx, rx) = bounded(2);
        let mut source = ChannelSource::new(rx);

        assert!(source.read(Duration::from_millis(5)).unwrap().is_none());

        tx.send(Ok(Frame::filled(1, 1, [0, 0, 0], 42))).unwrap();
        let frame = source.read(Duration::from_millis(5)).unwrap().unwrap();
        assert_eq!(frame.timestamp_ms, 42);

        drop(tx);
        assert!(matches!(
            source.read(Duration::from_millis(5)),
            Err(CaptureError::EndOfStream)
        ));
    }

    #[test]
    fn stopped_source_fails_reads() {
        let (_tx, rx) = bounded::<Result<Frame, CaptureError>>(1);
        let mut source = ChannelSource::new(rx);
        source.stop();
        assert!(source.read(Duration::from_millis(1)).is_err());
    }
}
