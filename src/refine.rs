//! Spot position refinement.
//!
//! Two stages per spot:
//! 1. **Weighted local maximum**: the frame is correlated with a small
//!    peaked kernel on a coarse grid inside the search radius; the grid point
//!    with the largest response becomes the new position. This is robust
//!    against single hot pixels and picks the brightest blob near the
//!    prediction.
//! 2. **Centroid**: the intensity-weighted centre of gravity over a disc
//!    around the stage-1 point gives the sub-pixel position.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MkivError, Result};
use crate::frame::Image;
use crate::spot::{Spot, SpotState};
use crate::Vector2;

/// Square correlation kernel for the local-maximum search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineKernel {
    /// Side length; must be odd.
    pub size: usize,
    /// Row-major weights, `size²` entries.
    pub weights: Vec<u32>,
}

impl Default for RefineKernel {
    fn default() -> Self {
        #[rustfmt::skip]
        let weights = vec![
            0, 1, 1, 1,  1, 1, 0,
            1, 1, 2, 2,  2, 1, 1,
            1, 2, 4, 8,  4, 2, 1,
            1, 2, 8, 16, 8, 2, 1,
            1, 2, 4, 8,  4, 2, 1,
            1, 1, 2, 2,  2, 1, 1,
            0, 1, 1, 1,  1, 1, 0,
        ];
        Self { size: 7, weights }
    }
}

impl RefineKernel {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size % 2 == 0 {
            return Err(MkivError::InvalidConfig(format!(
                "kernel size must be odd, got {}",
                self.size
            )));
        }
        if self.weights.len() != self.size * self.size {
            return Err(MkivError::InvalidConfig(format!(
                "kernel of size {} needs {} weights, got {}",
                self.size,
                self.size * self.size,
                self.weights.len()
            )));
        }
        if self.weights.iter().all(|&w| w == 0) {
            return Err(MkivError::InvalidConfig("kernel weights are all zero".into()));
        }
        Ok(())
    }

    fn half(&self) -> i64 {
        (self.size / 2) as i64
    }

    /// Kernel response centred on pixel `(x, y)`. Taps off the frame are skipped.
    fn response(&self, image: &Image, x: i64, y: i64) -> u64 {
        let half = self.half();
        let mut sum = 0u64;
        for ky in 0..self.size {
            let py = y + ky as i64 - half;
            for kx in 0..self.size {
                let w = self.weights[ky * self.size + kx];
                if w == 0 {
                    continue;
                }
                if let Some(v) = image.get_checked(x + kx as i64 - half, py) {
                    sum += u64::from(w) * u64::from(v);
                }
            }
        }
        sum
    }
}

/// Search window for one refinement pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineParams {
    /// Radius (pixels) of the local-maximum search around the current position.
    pub range: f64,
    /// Grid step of the local-maximum search.
    pub step: usize,
    /// Radius of the centroid disc.
    pub centroid_range: f64,
}

/// Moves spots onto the nearby intensity peak.
#[derive(Debug, Clone, Default)]
pub struct PeakRefiner {
    kernel: RefineKernel,
}

impl PeakRefiner {
    pub fn new(kernel: RefineKernel) -> Self {
        Self { kernel }
    }

    /// Refine every spot that has not passed the S/N gate.
    pub fn refine(&self, spots: &mut [Spot], image: &Image, params: &RefineParams) {
        let mut refined = 0usize;
        for spot in spots.iter_mut().filter(|s| !s.is_gated()) {
            if let Some(peak) = self.weighted_maximum(image, &spot.position, params.range, params.step) {
                spot.position = peak;
            }
            spot.position = centroid(image, &spot.position, params.centroid_range);
            spot.state = SpotState::Refined;
            refined += 1;
        }
        debug!(
            "Refined {} spots (range {:.2}, step {}, centroid {:.2})",
            refined, params.range, params.step, params.centroid_range
        );
    }

    /// Grid point within `range` of `start` with the largest positive kernel
    /// response, or `None` when the window is empty or dark.
    pub fn weighted_maximum(
        &self,
        image: &Image,
        start: &Vector2,
        range: f64,
        step: usize,
    ) -> Option<Vector2> {
        let step = step.max(1);
        let x_lo = ((start.x - range).ceil() as i64).max(0);
        let x_hi = ((start.x + range).floor() as i64).min(i64::from(image.width()) - 1);
        let y_lo = ((start.y - range).ceil() as i64).max(0);
        let y_hi = ((start.y + range).floor() as i64).min(i64::from(image.height()) - 1);

        let mut best_sum = 0u64;
        let mut best = None;
        for y in (y_lo..=y_hi).step_by(step) {
            for x in (x_lo..=x_hi).step_by(step) {
                let dx = x as f64 - start.x;
                let dy = y as f64 - start.y;
                if dx * dx + dy * dy > range * range {
                    continue;
                }
                let sum = self.kernel.response(image, x, y);
                if sum > best_sum {
                    best_sum = sum;
                    best = Some(Vector2::new(x as f64, y as f64));
                }
            }
        }
        best
    }
}

/// Intensity-weighted centre of gravity over the disc of radius `range`
/// around the pixel nearest `start`. Returns `start` when the disc is dark.
pub fn centroid(image: &Image, start: &Vector2, range: f64) -> Vector2 {
    let cx = start.x.round() as i64;
    let cy = start.y.round() as i64;
    let reach = range.ceil() as i64;
    let r2 = range * range;

    let mut sum = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            if (dx * dx + dy * dy) as f64 > r2 {
                continue;
            }
            if let Some(v) = image.get_checked(cx + dx, cy + dy) {
                let v = f64::from(v);
                sum += v;
                sum_x += v * dx as f64;
                sum_y += v * dy as f64;
            }
        }
    }
    if sum <= 0.0 {
        return *start;
    }
    Vector2::new(cx as f64 + sum_x / sum, cy as f64 + sum_y / sum)
}
