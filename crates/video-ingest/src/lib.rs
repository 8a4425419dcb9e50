//! Frame acquisition for the motion camera.
//!
//! Sources run on their own capture thread and hand frames over a bounded
//! channel; the pipeline sees them only through [`FrameSource`].

#[cfg(feature = "opencv")]
pub mod camera;
pub mod ffmpeg;
pub mod source;
pub mod types;

pub use source::{ChannelSource, FrameSource, SourceKind, open_source};
pub use types::{CaptureError, Frame, FrameFormat};
