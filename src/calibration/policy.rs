//! Acceptance rule for a recalibrated lattice.

use serde::{Deserialize, Serialize};

/// Decides whether a fitted candidate may replace the current model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptancePolicy {
    /// Largest tolerated shift (pixels) of the origin or either basis vector.
    /// Default: 2.5
    pub max_deviation: f64,

    /// Weight of the candidate when blending it into the model.
    /// Default: 0.7
    pub blend_factor: f64,

    /// How often a frame may be repeated after rejections before the candidate
    /// is accepted anyway.
    /// Default: 10
    pub max_repeats: u32,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            max_deviation: 2.5,
            blend_factor: 0.7,
            max_repeats: 10,
        }
    }
}

/// Result of [`AcceptancePolicy::judge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Discard the candidate and repeat the frame.
    Reject,
    /// Deviation too large but the repeat budget is spent.
    ForceAccept,
}

impl AcceptancePolicy {
    /// `deviations` are the shifts of origin, basis1 and basis2; `repeats` is
    /// how often the current frame has already been rejected.
    pub fn judge(&self, deviations: &[f64; 3], repeats: u32) -> Verdict {
        if deviations.iter().all(|&d| d <= self.max_deviation) {
            Verdict::Accept
        } else if repeats < self.max_repeats {
            Verdict::Reject
        } else {
            Verdict::ForceAccept
        }
    }
}
