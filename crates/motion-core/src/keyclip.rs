//! Pre-roll buffer and recording state machine.
//!
//! While idle, [`ClipBuffer`] keeps the most recent `capacity` frames. When the
//! caller starts a recording, those frames are drained oldest-first into a new
//! sink and every later frame is written straight through until `finish`.
//! The drain in `start` is the only hand-off between the two modes, so a frame
//! is never written twice and never skipped.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::container::{ClipWriter, Codec, DEFAULT_JPEG_QUALITY, FrameSink, SinkError};

pub const DEFAULT_BUFFER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("already recording to {path}")]
    AlreadyRecording { path: PathBuf },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Opens the sink for a new recording episode.
pub trait SinkOpener {
    type Sink: FrameSink;

    fn open(&mut self, path: &Path, codec: Codec, fps: f32) -> Result<Self::Sink, SinkError>;
}

/// Opens [`ClipWriter`]s on the local filesystem.
#[derive(Clone, Copy, Debug)]
pub struct ClipFileOpener {
    pub jpeg_quality: u8,
}

impl Default for ClipFileOpener {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl SinkOpener for ClipFileOpener {
    type Sink = ClipWriter;

    fn open(&mut self, path: &Path, codec: Codec, fps: f32) -> Result<ClipWriter, SinkError> {
        Ok(ClipWriter::create(path, codec, fps)?.with_jpeg_quality(self.jpeg_quality))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
}

/// Summary of a closed recording episode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedClip {
    pub path: PathBuf,
    pub frames: u64,
}

struct ActiveClip<S> {
    sink: S,
    path: PathBuf,
    frames: u64,
}

pub struct ClipBuffer<O: SinkOpener = ClipFileOpener> {
    capacity: usize,
    frames: VecDeque<Frame>,
    opener: O,
    active: Option<ActiveClip<O::Sink>>,
    consec_frames: usize,
}

impl<O: SinkOpener> ClipBuffer<O> {
    pub fn new(capacity: usize, opener: O) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: VecDeque::with_capacity(capacity),
            opener,
            active: None,
            consec_frames: 0,
        }
    }

    pub fn state(&self) -> RecordingState {
        if self.active.is_some() {
            RecordingState::Recording
        } else {
            RecordingState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Path of the clip being written, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|clip| clip.path.as_path())
    }

    /// Buffered pre-roll frames, oldest first.
    pub fn buffered(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn buffered_len(&self) -> usize {
        self.frames.len()
    }

    /// Consecutive frames without motion since the last motion frame.
    pub fn consec_frames(&self) -> usize {
        self.consec_frames
    }

    /// Record that the current frame contained motion.
    pub fn mark_motion(&mut self) {
        self.consec_frames = 0;
    }

    /// Record a frame without motion and return the new streak length.
    pub fn mark_still(&mut self) -> usize {
        self.consec_frames = self.consec_frames.saturating_add(1);
        self.consec_frames
    }

    /// True exactly when the post-roll has run as long as the pre-roll.
    pub fn should_finish(&self) -> bool {
        self.is_recording() && self.consec_frames == self.capacity
    }

    /// Feed one frame. Buffers it while idle and writes it while recording.
    ///
    /// A write failure aborts the episode: the sink is closed, the buffer
    /// returns to idle with this frame as its first entry, and the error is
    /// returned.
    pub fn update(&mut self, frame: &Frame) -> Result<(), ClipError> {
        let Some(active) = self.active.as_mut() else {
            self.frames.push_back(frame.clone());
            while self.frames.len() > self.capacity {
                self.frames.pop_front();
            }
            return Ok(());
        };

        match active.sink.write_frame(frame) {
            Ok(()) => {
                active.frames += 1;
                Ok(())
            }
            Err(err) => {
                self.abort(&err);
                self.frames.push_back(frame.clone());
                Err(err.into())
            }
        }
    }

    /// Open a sink at `path` and flush the pre-roll into it.
    ///
    /// Starting twice is a caller bug and fails without touching the open
    /// sink. If the sink cannot be opened the buffer is left intact.
    pub fn start(&mut self, path: &Path, codec: Codec, fps: f32) -> Result<(), ClipError> {
        if let Some(active) = self.active.as_ref() {
            return Err(ClipError::AlreadyRecording {
                path: active.path.clone(),
            });
        }

        let mut sink = self.opener.open(path, codec, fps)?;
        let mut written = 0u64;
        while let Some(frame) = self.frames.pop_front() {
            if let Err(err) = sink.write_frame(&frame) {
                warn!(path = %path.display(), "pre-roll flush failed: {err}");
                self.frames.push_front(frame);
                let _ = sink.close();
                return Err(err.into());
            }
            written += 1;
        }

        info!(path = %path.display(), preroll = written, "clip recording started");
        self.active = Some(ActiveClip {
            sink,
            path: path.to_path_buf(),
            frames: written,
        });
        self.consec_frames = 0;
        Ok(())
    }

    /// Close the current clip. A no-op returning `Ok(None)` when idle.
    pub fn finish(&mut self) -> Result<Option<FinishedClip>, ClipError> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };
        let closed = active.sink.close();
        info!(
            path = %active.path.display(),
            frames = active.frames,
            "clip recording finished"
        );
        closed?;
        Ok(Some(FinishedClip {
            path: active.path,
            frames: active.frames,
        }))
    }

    fn abort(&mut self, err: &SinkError) {
        if let Some(mut active) = self.active.take() {
            warn!(
                path = %active.path.display(),
                frames = active.frames,
                "aborting clip after sink error: {err}"
            );
            if let Err(close_err) = active.sink.close() {
                debug!("closing aborted clip failed: {close_err}");
            }
        }
    }
}

impl<O: SinkOpener> Drop for ClipBuffer<O> {
    fn drop(&mut self) {
        if self.is_recording() {
            let _ = self.finish();
        }
    }
}
