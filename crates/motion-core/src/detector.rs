//! Running-average background model and frame differencing.
//!
//! The model is an exponentially weighted average of past grayscale frames.
//! `detect` compares a frame against the model, `update` folds the frame into
//! it. The pipeline calls `detect` first and `update` second on every frame so
//! detection always sees the background as it stood before the frame.

use image::GrayImage;
use thiserror::Error;

pub const DEFAULT_ACCUM_WEIGHT: f32 = 0.1;
pub const DEFAULT_DELTA_THRESHOLD: u8 = 25;
const MORPH_ITERATIONS: usize = 2;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("frame is {actual:?} but the background model is {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Inclusive pixel bounds of the changed area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Positive detection result. A frame without motion yields `None` instead,
/// so there is never an empty region to read.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Motion {
    pub region: BoundingBox,
    /// Foreground pixels left after noise suppression.
    pub changed_pixels: usize,
    /// `changed_pixels` relative to the frame area.
    pub score: f32,
    /// Per-pixel difference threshold that produced the mask.
    pub threshold: u8,
}

pub struct MotionDetector {
    accum_weight: f32,
    delta_threshold: u8,
    background: Option<Background>,
    frames_seen: u64,
}

struct Background {
    width: u32,
    height: u32,
    mean: Vec<f32>,
}

impl MotionDetector {
    pub fn new(accum_weight: f32) -> Self {
        Self {
            accum_weight: accum_weight.clamp(f32::EPSILON, 1.0),
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            background: None,
            frames_seen: 0,
        }
    }

    pub fn with_delta_threshold(mut self, threshold: u8) -> Self {
        self.delta_threshold = threshold;
        self
    }

    /// Number of frames folded into the model since it was last seeded.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn is_warm(&self, warm_up: u64) -> bool {
        self.background.is_some() && self.frames_seen >= warm_up
    }

    /// Fold `image` into the background average.
    ///
    /// A frame whose size differs from the model reseeds it, which restarts
    /// warm-up.
    pub fn update(&mut self, image: &GrayImage) {
        let (width, height) = image.dimensions();
        match self.background.as_mut() {
            Some(bg) if bg.width == width && bg.height == height => {
                let alpha = self.accum_weight;
                for (mean, px) in bg.mean.iter_mut().zip(image.as_raw()) {
                    *mean = (1.0 - alpha) * *mean + alpha * (*px as f32);
                }
                self.frames_seen = self.frames_seen.saturating_add(1);
            }
            _ => {
                if self.background.is_some() {
                    tracing::warn!(width, height, "frame size changed; reseeding background");
                }
                self.background = Some(Background {
                    width,
                    height,
                    mean: image.as_raw().iter().map(|&px| px as f32).collect(),
                });
                self.frames_seen = 1;
            }
        }
    }

    /// Compare `image` against the background.
    ///
    /// Returns `Ok(None)` when nothing crosses the threshold or when no
    /// background exists yet.
    pub fn detect(&self, image: &GrayImage) -> Result<Option<Motion>, MotionError> {
        let Some(bg) = self.background.as_ref() else {
            return Ok(None);
        };
        let (width, height) = image.dimensions();
        if (bg.width, bg.height) != (width, height) {
            return Err(MotionError::DimensionMismatch {
                expected: (bg.width, bg.height),
                actual: (width, height),
            });
        }

        let mut mask: Vec<bool> = bg
            .mean
            .iter()
            .zip(image.as_raw())
            .map(|(&mean, &px)| (mean as u8).abs_diff(px) > self.delta_threshold)
            .collect();

        for _ in 0..MORPH_ITERATIONS {
            mask = morph(&mask, width, height, Morph::Erode);
        }
        for _ in 0..MORPH_ITERATIONS {
            mask = morph(&mask, width, height, Morph::Dilate);
        }

        let mut region: Option<BoundingBox> = None;
        let mut changed_pixels = 0usize;
        for (idx, _) in mask.iter().enumerate().filter(|(_, on)| **on) {
            changed_pixels += 1;
            let x = (idx % width as usize) as u32;
            let y = (idx / width as usize) as u32;
            region = Some(match region {
                None => BoundingBox {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
                Some(b) => BoundingBox {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            });
        }

        Ok(region.map(|region| Motion {
            region,
            changed_pixels,
            score: changed_pixels as f32 / mask.len().max(1) as f32,
            threshold: self.delta_threshold,
        }))
    }
}

#[derive(Clone, Copy)]
enum Morph {
    Erode,
    Dilate,
}

/// One pass of 3x3 erosion or dilation. Out-of-bounds neighbours are ignored.
fn morph(mask: &[bool], width: u32, height: u32, op: Morph) -> Vec<bool> {
    let (w, h) = (width as i64, height as i64);
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            let mut all = true;
            let mut any = false;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        continue;
                    }
                    let on = mask[(ny * w + nx) as usize];
                    all &= on;
                    any |= on;
                }
            }
            out[(y * w + x) as usize] = match op {
                Morph::Erode => all,
                Morph::Dilate => any,
            };
        }
    }
    out
}
