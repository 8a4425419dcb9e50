//! Configuration parsing for the motion monitor.
//!
//! This module owns translation of CLI arguments into a `MonitorConfig`
//! struct which the pipeline and server use without re-parsing flags.

use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use clap::Args;
use motion_core::{
    Codec,
    container::DEFAULT_JPEG_QUALITY,
    detector::{DEFAULT_ACCUM_WEIGHT, DEFAULT_DELTA_THRESHOLD},
    keyclip::DEFAULT_BUFFER_SIZE,
};
use video_ingest::SourceKind;

const MIN_WIDTH: u32 = 16;
const DEFAULT_WARM_UP: u64 = 32;

#[derive(Clone, Debug)]
/// Canonical configuration shared by the pipeline and the HTTP layer.
pub struct MonitorConfig {
    /// Camera index, device path, RTSP URL or video file.
    pub source_uri: String,
    pub source_kind: SourceKind,
    /// Address the HTTP server binds to.
    pub ip: String,
    pub port: u16,
    /// Frames absorbed by the background model before detection runs.
    pub warm_up: u64,
    /// Pre-roll length, and the number of still frames that ends a clip.
    pub buffer_size: usize,
    pub codec: Codec,
    /// Frame rate written into clip headers.
    pub fps: f32,
    /// Directory holding recorded clips.
    pub output_dir: PathBuf,
    /// Canonical processing width; frames are resized to it.
    pub width: u32,
    pub accum_weight: f32,
    pub delta_threshold: u8,
    pub jpeg_quality: u8,
    /// Outline the detected region on the published frame.
    pub draw_motion_box: bool,
    /// Upper bound on concurrent clip playback sessions.
    pub max_playback: usize,
    /// Replay clips at their recorded rate rather than as fast as they decode.
    pub paced_playback: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Camera index, `/dev/videoN`, `rtsp://` URL or video file.
    #[arg(long = "source", short = 's', value_name = "URI", default_value = "0")]
    pub source: String,
    /// IP address the HTTP server binds to.
    #[arg(long = "ip", short = 'i', default_value = "0.0.0.0")]
    pub ip: String,
    /// HTTP port.
    #[arg(long = "port", short = 'p', default_value_t = 8000)]
    pub port: u16,
    /// Frames used to build the background model before detecting.
    #[arg(long = "frame-count", value_name = "N", default_value_t = DEFAULT_WARM_UP)]
    pub frame_count: u64,
    /// Pre-roll and post-roll length in frames.
    #[arg(long = "buffer-size", short = 'b', value_name = "N", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
    /// Clip codec: MJPG or RAW.
    #[arg(long = "codec", short = 'c', default_value = "MJPG")]
    pub codec: String,
    /// Frame rate recorded in clip files.
    #[arg(long = "fps", short = 'f', default_value_t = 20.0)]
    pub fps: f32,
    /// Directory for recorded clips.
    #[arg(long = "output", short = 'o', value_name = "DIR", default_value = "output")]
    pub output: PathBuf,
    /// Processing width in pixels.
    #[arg(long = "width", value_name = "PX", default_value_t = 400)]
    pub width: u32,
    /// Background model decay weight in (0, 1].
    #[arg(long = "accum-weight", default_value_t = DEFAULT_ACCUM_WEIGHT)]
    pub accum_weight: f32,
    /// Per-pixel difference that counts as change.
    #[arg(long = "delta-threshold", default_value_t = DEFAULT_DELTA_THRESHOLD)]
    pub delta_threshold: u8,
    /// JPEG quality for streams and MJPG clips (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = DEFAULT_JPEG_QUALITY)]
    pub jpeg_quality: u8,
    /// Draw the detected motion region on the live stream.
    #[arg(long = "draw-motion-box", action = clap::ArgAction::SetTrue)]
    pub draw_motion_box: bool,
    /// Maximum concurrent clip playback sessions.
    #[arg(long = "max-playback", value_name = "N", default_value_t = 4)]
    pub max_playback: usize,
    /// Replay clips as fast as they decode instead of at their recorded rate.
    #[arg(long = "unpaced-playback", action = clap::ArgAction::SetTrue)]
    pub unpaced_playback: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<RunArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }
        if args.buffer_size == 0 {
            bail!("--buffer-size must be at least 1");
        }
        if !(args.fps.is_finite() && args.fps > 0.0) {
            bail!("--fps must be a positive number");
        }
        if args.width < MIN_WIDTH {
            bail!("--width must be at least {MIN_WIDTH} pixels");
        }
        if !(args.accum_weight > 0.0 && args.accum_weight <= 1.0) {
            bail!("--accum-weight must be in (0, 1]");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.max_playback == 0 {
            bail!("--max-playback must be at least 1");
        }
        let codec: Codec = args
            .codec
            .parse()
            .map_err(|err: String| anyhow!("--codec: {err}"))?;

        let source_kind = SourceKind::from_uri(&args.source);

        Ok(Self {
            source_uri: args.source,
            source_kind,
            ip: args.ip,
            port: args.port,
            warm_up: args.frame_count,
            buffer_size: args.buffer_size,
            codec,
            fps: args.fps,
            output_dir: args.output,
            width: args.width,
            accum_weight: args.accum_weight,
            delta_threshold: args.delta_threshold,
            jpeg_quality: args.jpeg_quality,
            draw_motion_box: args.draw_motion_box,
            max_playback: args.max_playback,
            paced_playback: !args.unpaced_playback,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
