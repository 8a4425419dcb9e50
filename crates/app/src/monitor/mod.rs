//! Motion-triggered recorder that captures frames, detects movement against a
//! running background model, and writes clips with pre-roll and post-roll.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Orchestrates the capture → detect → record → publish loop.
//! - `playback`: Bounded pool of clip replay sessions.
//! - `server`: Actix Web live feed, clip archive and playback endpoints.
//! - `telemetry`: Tracing subscriber, Chrome traces and Prometheus recorder.
//! - `data`: Status snapshot shared between the pipeline and the server.
//! - `annotation`: Timestamp and motion box drawing.

/// Re-export settings so callers can configure runs without reaching into
/// submodules.
pub use config::{MonitorConfig, RunArgs};
/// Launch the monitor with a ready-made configuration.
pub use pipeline::run;

mod annotation;
mod config;
mod data;
mod pipeline;
mod playback;
mod server;
mod telemetry;
