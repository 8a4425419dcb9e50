//! Replays a recorded clip into its own broadcaster.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info_span};

use crate::{
    broadcast::FrameBroadcaster,
    container::{ClipReader, SinkError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEnd {
    /// Every frame in the clip was published.
    EndOfClip,
    /// All subscribers went away before the clip ended.
    NoViewers,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub frames: u64,
    pub end: PlaybackEnd,
}

/// Decodes a clip sequentially and publishes each frame.
///
/// One feeder serves one viewer session. It runs on the calling thread until
/// the clip ends or nobody is subscribed to its broadcaster any more, then
/// drops its broadcaster handle so subscriber streams terminate.
pub struct ClipPlaybackFeeder<R: Read = BufReader<File>> {
    reader: ClipReader<R>,
    broadcaster: Arc<FrameBroadcaster>,
    paced: bool,
}

impl ClipPlaybackFeeder {
    pub fn open(path: &Path, broadcaster: Arc<FrameBroadcaster>) -> Result<Self, SinkError> {
        Ok(Self::new(ClipReader::open(path)?, broadcaster))
    }
}

impl<R: Read> ClipPlaybackFeeder<R> {
    pub fn new(reader: ClipReader<R>, broadcaster: Arc<FrameBroadcaster>) -> Self {
        Self {
            reader,
            broadcaster,
            paced: true,
        }
    }

    /// With pacing off, frames are published as fast as they decode.
    pub fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Delay between frames at the clip's recorded rate.
    pub fn frame_interval(&self) -> Option<Duration> {
        let fps = f64::from(self.reader.header().fps);
        (self.paced && fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps))
    }

    pub fn run(mut self) -> Result<PlaybackSummary, SinkError> {
        let header = self.reader.header();
        let span = info_span!("playback.session", codec = %header.codec, fps = header.fps);
        let _guard = span.enter();

        let interval = self.frame_interval();
        let started = Instant::now();
        let mut frames = 0u64;

        let end = loop {
            if self.broadcaster.consumer_count() == 0 {
                break PlaybackEnd::NoViewers;
            }
            let Some(frame) = self.reader.next_frame()? else {
                break PlaybackEnd::EndOfClip;
            };
            if let Some(interval) = interval {
                let due = started + interval.mul_f64(frames as f64);
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            self.broadcaster.publish(frame);
            frames += 1;
        };

        debug!(frames, ?end, "playback finished");
        Ok(PlaybackSummary { frames, end })
    }
}
