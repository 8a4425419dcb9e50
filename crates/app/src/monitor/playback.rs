//! Bounded pool of clip playback sessions.
//!
//! Each session owns a feeder thread and a private broadcaster. A semaphore
//! permit travels with the thread, so a slot frees up only when the feeder
//! has actually stopped.

use std::{io, path::Path, sync::Arc};

use motion_core::{ClipPlaybackFeeder, FrameBroadcaster, FrameSubscriber, SinkError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::monitor::telemetry;

#[derive(Debug, Error)]
pub(crate) enum PlaybackError {
    #[error("all {0} playback slots are in use")]
    Busy(usize),
    #[error("clip not found")]
    Missing,
    #[error("cannot open clip: {0}")]
    Open(#[source] SinkError),
    #[error("cannot spawn playback thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Clone)]
pub(crate) struct PlaybackPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    paced: bool,
}

impl PlaybackPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            paced: true,
        }
    }

    pub(crate) fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub(crate) fn active(&self) -> usize {
        self.capacity.saturating_sub(self.permits.available_permits())
    }

    /// Start replaying `path` and return a subscription to it.
    ///
    /// The session ends at end of clip or once the returned subscriber is
    /// dropped.
    pub(crate) fn start(&self, path: &Path) -> Result<FrameSubscriber, PlaybackError> {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| PlaybackError::Busy(self.capacity))?;

        let broadcaster = Arc::new(FrameBroadcaster::new());
        let subscriber = broadcaster.subscribe();
        let feeder = ClipPlaybackFeeder::open(path, broadcaster)
            .map_err(|err| match err {
                SinkError::Open { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                    PlaybackError::Missing
                }
                other => PlaybackError::Open(other),
            })?
            .with_pacing(self.paced);

        let clip = path.display().to_string();
        metrics::gauge!("monitor_playback_sessions").increment(1.0);
        telemetry::spawn_thread("clip-playback", move || {
            let _permit = permit;
            match feeder.run() {
                Ok(summary) => debug!(
                    clip = %clip,
                    frames = summary.frames,
                    end = ?summary.end,
                    "playback session closed"
                ),
                Err(err) => warn!(clip = %clip, "playback failed: {err}"),
            }
            metrics::gauge!("monitor_playback_sessions").decrement(1.0);
        })
        .map_err(|err| {
            metrics::gauge!("monitor_playback_sessions").decrement(1.0);
            PlaybackError::Spawn(err)
        })?;

        Ok(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use motion_core::{ClipWriter, Codec, FrameSink};
    use video_ingest::Frame;

    use super::*;

    fn write_clip(dir: &Path, frames: i64, fps: f32) -> std::path::PathBuf {
        let path = dir.join("20240309-071502.clip");
        let mut writer = ClipWriter::create(&path, Codec::Raw, fps).unwrap();
        for ts in 0..frames {
            writer.write_frame(&Frame::filled(4, 4, [1, 2, 3], ts)).unwrap();
        }
        writer.close().unwrap();
        path
    }

    fn wait_until_idle(pool: &PlaybackPool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active() > 0 {
            assert!(Instant::now() < deadline, "session did not stop");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn missing_clip_is_reported_and_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PlaybackPool::new(1);
        let err = pool.start(&dir.path().join("absent.clip")).unwrap_err();
        assert!(matches!(err, PlaybackError::Missing));
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_clip(dir.path(), 200, 10.0);
        let pool = PlaybackPool::new(1);

        let first = pool.start(&path).unwrap();
        assert_eq!(pool.active(), 1);
        assert!(matches!(pool.start(&path), Err(PlaybackError::Busy(1))));

        drop(first);
        wait_until_idle(&pool);
        let _second = pool.start(&path).unwrap();
    }

    #[test]
    fn unpaced_session_outruns_the_recorded_rate() {
        let dir = tempfile::tempdir().unwrap();
        // 50 frames at 1 fps would take most of a minute when paced.
        let path = write_clip(dir.path(), 50, 1.0);
        let pool = PlaybackPool::new(1).with_pacing(false);
        let started = Instant::now();
        let _viewer = pool.start(&path).unwrap();
        wait_until_idle(&pool);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn session_ends_with_the_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_clip(dir.path(), 3, 500.0);
        let pool = PlaybackPool::new(2);
        let _viewer = pool.start(&path).unwrap();
        wait_until_idle(&pool);
    }
}
