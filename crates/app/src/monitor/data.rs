use std::sync::{Arc, Mutex};

use motion_core::BoundingBox;
use serde::Serialize;

/// Snapshot of the pipeline served by `/status`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct PipelineStatus {
    pub(crate) frames_processed: u64,
    pub(crate) warm: bool,
    pub(crate) recording: bool,
    pub(crate) current_clip: Option<String>,
    pub(crate) still_frames: usize,
    pub(crate) clips_recorded: u64,
    pub(crate) last_motion: Option<BoundingBox>,
    pub(crate) last_frame_ms: Option<i64>,
    pub(crate) fps: f32,
}

pub(crate) type SharedStatus = Arc<Mutex<PipelineStatus>>;

pub(crate) fn read_status(shared: &SharedStatus) -> PipelineStatus {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}
