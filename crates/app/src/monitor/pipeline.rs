//! Pipeline driver: capture, detect, record and publish, one frame at a time.
//!
//! Every iteration runs the same fixed sequence: resize, grayscale and blur
//! for detection, stamp the display copy, detect against the background as
//! it stood before this frame, fold the frame into the background, feed the
//! clip buffer, close the clip once the post-roll has elapsed, and publish.
//! Nothing outside [`MotionPipeline::process`] touches the detector or the
//! clip buffer, so the detect-then-update order cannot drift.

use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, TimeZone};
use image::RgbImage;
use motion_core::{
    ClipBuffer, ClipFileOpener, Codec, FinishedClip, FrameBroadcaster, Motion, MotionDetector,
    MotionError, SinkOpener, imaging, naming,
};
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::monitor::{
    annotation,
    config::MonitorConfig,
    data::SharedStatus,
    playback::PlaybackPool,
    server::{ServerState, StreamShutdown, spawn_http_server},
    telemetry,
};

const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Run the monitor until Ctrl+C or until the source runs dry.
pub fn run(config: MonitorConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let prometheus = telemetry::init_metrics_recorder();
    let pipeline_span = info_span!(
        "monitor.pipeline",
        source = %config.source_uri,
        width = config.width,
        warm_up = config.warm_up,
        buffer_size = config.buffer_size,
        codec = %config.codec,
        fps = config.fps
    );
    let _pipeline_span_guard = pipeline_span.enter();

    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create clip directory {}",
            config.output_dir.display()
        )
    })?;

    debug!(
        "Capture source: {} ({:?})",
        config.source_uri, config.source_kind
    );
    let mut source = video_ingest::open_source(&config.source_uri)
        .with_context(|| format!("Failed to open capture source {}", config.source_uri))?;

    let broadcaster = Arc::new(FrameBroadcaster::new());
    let status = SharedStatus::default();
    let server = spawn_http_server(
        ServerState {
            live: broadcaster.clone(),
            status: status.clone(),
            output_dir: config.output_dir.clone(),
            playback: PlaybackPool::new(config.max_playback).with_pacing(config.paced_playback),
            jpeg_quality: config.jpeg_quality,
            prometheus: Some(prometheus),
            streams: StreamShutdown::default(),
        },
        (config.ip.as_str(), config.port),
    )
    .context("Failed to start HTTP server")?;
    info!(
        "Live stream at http://{}/video_feed, press Ctrl+C to stop",
        server.local_addr()
    );

    let pipeline = MotionPipeline::from_config(&config, broadcaster, status);
    let worker_shutdown = shutdown.clone();
    let worker_span = pipeline_span.clone();
    let worker = telemetry::spawn_thread("motion-pipeline", move || {
        worker_span.in_scope(|| pipeline.run(source.as_mut(), &worker_shutdown))
    })
    .context("Failed to spawn pipeline thread")?;

    let result = worker
        .join()
        .map_err(|_| anyhow!("pipeline thread panicked"))
        .and_then(|result| result);

    debug!("Stopping HTTP server");
    server.stop();
    if let Err(err) = &result {
        error!("Pipeline stopped: {err:#}");
    }
    result
}

/// Knobs the driver needs from [`MonitorConfig`].
#[derive(Clone, Debug)]
pub(crate) struct PipelineSettings {
    pub(crate) width: u32,
    pub(crate) warm_up: u64,
    pub(crate) codec: Codec,
    pub(crate) fps: f32,
    pub(crate) output_dir: PathBuf,
    pub(crate) draw_motion_box: bool,
}

impl From<&MonitorConfig> for PipelineSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            width: config.width,
            warm_up: config.warm_up,
            codec: config.codec,
            fps: config.fps,
            output_dir: config.output_dir.clone(),
            draw_motion_box: config.draw_motion_box,
        }
    }
}

/// What one iteration did, for callers and tests.
#[derive(Debug, Default)]
pub(crate) struct FrameOutcome {
    pub(crate) motion: Option<Motion>,
    pub(crate) started: Option<PathBuf>,
    pub(crate) finished: Option<FinishedClip>,
}

pub(crate) struct MotionPipeline<O: SinkOpener = ClipFileOpener> {
    settings: PipelineSettings,
    detector: MotionDetector,
    clips: ClipBuffer<O>,
    broadcaster: Arc<FrameBroadcaster>,
    status: SharedStatus,
    frames: u64,
    clips_recorded: u64,
    smoothed_fps: f32,
}

impl MotionPipeline {
    pub(crate) fn from_config(
        config: &MonitorConfig,
        broadcaster: Arc<FrameBroadcaster>,
        status: SharedStatus,
    ) -> Self {
        let detector =
            MotionDetector::new(config.accum_weight).with_delta_threshold(config.delta_threshold);
        let clips = ClipBuffer::new(
            config.buffer_size,
            ClipFileOpener {
                jpeg_quality: config.jpeg_quality,
            },
        );
        MotionPipeline::new(config.into(), detector, clips, broadcaster, status)
    }
}

impl<O: SinkOpener> MotionPipeline<O> {
    pub(crate) fn new(
        settings: PipelineSettings,
        detector: MotionDetector,
        clips: ClipBuffer<O>,
        broadcaster: Arc<FrameBroadcaster>,
        status: SharedStatus,
    ) -> Self {
        Self {
            settings,
            detector,
            clips,
            broadcaster,
            status,
            frames: 0,
            clips_recorded: 0,
            smoothed_fps: 0.0,
        }
    }

    /// Pull frames until shutdown is requested or the source fails.
    ///
    /// An open clip is always finished before returning. End of stream is a
    /// normal exit; any other capture error is returned.
    pub(crate) fn run(mut self, source: &mut dyn FrameSource, shutdown: &AtomicBool) -> Result<()> {
        let mut last_instant = Instant::now();
        let mut result = Ok(());

        while !shutdown.load(Ordering::Relaxed) {
            let frame = match info_span!("capture.recv").in_scope(|| source.read(READ_TIMEOUT)) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(CaptureError::EndOfStream) => {
                    info!("Frame source ended");
                    break;
                }
                Err(err) => {
                    result = Err(anyhow::Error::new(err).context("Capture failed"));
                    break;
                }
            };

            let frame_span = info_span!(
                "frame",
                frame = self.frames + 1,
                width = frame.width,
                height = frame.height,
                timestamp = frame.timestamp_ms
            );
            let _frame_guard = frame_span.enter();

            let now = Instant::now();
            let elapsed = now.duration_since(last_instant).as_secs_f32();
            last_instant = now;
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed_fps = if self.smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed_fps + 0.1 * instant
                };
            }
            metrics::gauge!("monitor_pipeline_fps").set(self.smoothed_fps as f64);

            let stage_start = Instant::now();
            if let Err(err) = self.process(&frame) {
                warn!("Dropping frame: {err:#}");
            }
            metrics::histogram!("monitor_stage_latency_seconds", "stage" => "process")
                .record(stage_start.elapsed().as_secs_f64());

            if self.frames % 100 == 0 {
                debug!(
                    "Pipeline heartbeat: frame #{}, {:.1} fps, recording={}",
                    self.frames,
                    self.smoothed_fps,
                    self.clips.is_recording()
                );
            }
        }

        self.shutdown();
        source.stop();
        result
    }

    /// Run one iteration of the driver on `frame`.
    pub(crate) fn process(&mut self, frame: &Frame) -> Result<FrameOutcome> {
        let resized =
            imaging::resize_to_width(frame, self.settings.width).context("Failed to resize frame")?;
        let gray = imaging::detection_image(&resized);
        let timestamp_ms = resized.timestamp_ms;
        let stamped = redraw(resized, |image| {
            annotation::stamp_timestamp(image, &local_time(timestamp_ms));
        })?;

        self.frames += 1;
        metrics::counter!("monitor_frames_total").increment(1);

        let warm = self.detector.is_warm(self.settings.warm_up);
        let motion = if warm { self.detect(&gray) } else { None };

        let mut outcome = FrameOutcome::default();
        if motion.is_some() {
            metrics::counter!("monitor_motion_frames_total").increment(1);
            self.clips.mark_motion();
            if !self.clips.is_recording() {
                outcome.started = self.start_clip(timestamp_ms);
            }
        } else if warm {
            self.clips.mark_still();
        }

        self.detector.update(&gray);
        if let Err(err) = self.clips.update(&stamped) {
            metrics::counter!("monitor_sink_errors_total").increment(1);
            warn!("Clip write failed, recording aborted: {err}");
        }

        if self.clips.should_finish() {
            outcome.finished = self.finish_clip();
        }

        let published = match (&motion, self.settings.draw_motion_box) {
            (Some(motion), true) => redraw(stamped, |image| {
                annotation::draw_motion_box(image, &motion.region);
            })?,
            _ => stamped,
        };
        self.broadcaster.publish(published);

        self.record_status(warm, motion.as_ref(), timestamp_ms);
        outcome.motion = motion;
        Ok(outcome)
    }

    /// Finish any open clip. Safe to call repeatedly.
    pub(crate) fn shutdown(&mut self) {
        if self.clips.is_recording() {
            info!("Finishing open clip before shutdown");
            self.finish_clip();
            self.record_status(false, None, 0);
        }
    }

    fn detect(&mut self, gray: &image::GrayImage) -> Option<Motion> {
        match self.detector.detect(gray) {
            Ok(motion) => motion,
            // The update that follows reseeds the model at the new size.
            Err(MotionError::DimensionMismatch { expected, actual }) => {
                warn!(?expected, ?actual, "Frame size changed; skipping detection");
                None
            }
        }
    }

    fn start_clip(&mut self, timestamp_ms: i64) -> Option<PathBuf> {
        let stem = naming::clip_stem_for_millis(timestamp_ms);
        let path = naming::clip_path(&self.settings.output_dir, &stem);
        let _span = info_span!("clip.start", clip = %stem).entered();
        match self
            .clips
            .start(&path, self.settings.codec, self.settings.fps)
        {
            Ok(()) => {
                metrics::counter!("monitor_clips_started_total").increment(1);
                Some(path)
            }
            Err(err) => {
                metrics::counter!("monitor_sink_errors_total").increment(1);
                warn!("Could not start clip {}: {err}", path.display());
                None
            }
        }
    }

    fn finish_clip(&mut self) -> Option<FinishedClip> {
        let _span = info_span!("clip.finish").entered();
        match self.clips.finish() {
            Ok(Some(clip)) => {
                metrics::counter!("monitor_clips_finished_total").increment(1);
                self.clips_recorded += 1;
                Some(clip)
            }
            Ok(None) => None,
            Err(err) => {
                metrics::counter!("monitor_sink_errors_total").increment(1);
                warn!("Closing clip failed: {err}");
                None
            }
        }
    }

    fn record_status(&self, warm: bool, motion: Option<&Motion>, timestamp_ms: i64) {
        let Ok(mut status) = self.status.lock() else {
            return;
        };
        status.frames_processed = self.frames;
        status.warm = warm || status.warm;
        status.recording = self.clips.is_recording();
        status.current_clip = self
            .clips
            .current_path()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned());
        status.still_frames = self.clips.consec_frames();
        status.clips_recorded = self.clips_recorded;
        if let Some(motion) = motion {
            status.last_motion = Some(motion.region);
        }
        if timestamp_ms != 0 {
            status.last_frame_ms = Some(timestamp_ms);
        }
        status.fps = self.smoothed_fps;
    }
}

/// Draw on an RGB frame in place.
fn redraw(frame: Frame, draw: impl FnOnce(&mut RgbImage)) -> Result<Frame> {
    let timestamp_ms = frame.timestamp_ms;
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.data)
        .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;
    draw(&mut image);
    Ok(imaging::frame_from_rgb(image, timestamp_ms))
}

fn local_time(timestamp_ms: i64) -> DateTime<Local> {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .earliest()
        .unwrap_or_else(Local::now)
}
