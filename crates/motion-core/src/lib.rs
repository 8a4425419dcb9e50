//! Motion detection, pre-roll clip recording and frame fan-out.
//!
//! Everything here is driven by a single pipeline thread except
//! [`FrameBroadcaster`], which is the one handle shared with stream consumers.

pub mod broadcast;
pub mod container;
pub mod detector;
pub mod imaging;
pub mod keyclip;
pub mod naming;
pub mod playback;

pub use broadcast::{FrameBroadcaster, FrameSubscriber, consume_stream};
pub use container::{ClipReader, ClipWriter, Codec, FrameSink, SinkError};
pub use detector::{BoundingBox, Motion, MotionDetector, MotionError};
pub use imaging::EncodeError;
pub use keyclip::{ClipBuffer, ClipError, ClipFileOpener, FinishedClip, RecordingState, SinkOpener};
pub use naming::{ClipEntry, NameError, list_clips};
pub use playback::{ClipPlaybackFeeder, PlaybackEnd, PlaybackSummary};
