//! Diffraction spots and their reciprocal-lattice indices.

use serde::{Deserialize, Serialize};

use crate::Vector2;

/// Two indices closer than this are the same reflex.
pub const INDEX_TOLERANCE: f64 = 0.05;

/// Intensity written for spots that could not be measured.
pub const INTENSITY_SENTINEL: f64 = -999.0;

/// Reciprocal-lattice index `(h, k)`. Fractional for superstructure reflexes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatticeIndex {
    pub h: f64,
    pub k: f64,
}

impl LatticeIndex {
    pub const fn new(h: f64, k: f64) -> Self {
        Self { h, k }
    }

    pub fn distance(&self, other: &LatticeIndex) -> f64 {
        (self.h - other.h).hypot(self.k - other.k)
    }

    /// True when `other` names the same reflex within [`INDEX_TOLERANCE`].
    pub fn matches(&self, other: &LatticeIndex) -> bool {
        self.distance(other) < INDEX_TOLERANCE
    }

    /// Position of an index relative to the lattice origin, before any radial
    /// correction.
    pub fn offset(&self, basis1: &Vector2, basis2: &Vector2) -> Vector2 {
        basis1 * self.h + basis2 * self.k
    }
}

impl std::fmt::Display for LatticeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2})", self.h, self.k)
    }
}

/// Processing state of a spot within one frame.
///
/// `Candidate → Refined → {Measured | Gated | OutOfFrame}`. A spot leaves
/// `Gated` only when the next frame builds a fresh list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpotState {
    /// Enumerated, position equals the prediction.
    #[default]
    Candidate,
    /// Position refined by the peak search, not yet integrated.
    Refined,
    /// Integrated, but S/N below the active threshold.
    Measured,
    /// Integrated and passed the S/N gate. Excluded from further refinement.
    Gated,
    /// Aperture or background ring fell off the frame or mask.
    OutOfFrame,
}

/// Membership in the configured index lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Membership {
    pub desired: bool,
    pub reference: bool,
    pub excluded: bool,
}

/// A candidate or measured reflex.
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub index: LatticeIndex,
    /// Position predicted by the geometry model. Never changed after enumeration.
    pub predicted: Vector2,
    /// Working position, moved by the peak refiner.
    pub position: Vector2,
    /// |k∥| in Å⁻¹.
    pub parallel_momentum: f64,
    /// Cosine of the emergence angle.
    pub cos_theta: f64,
    pub intensity: f64,
    pub signal_to_noise: f64,
    pub signal_to_background: f64,
    pub membership: Membership,
    pub state: SpotState,
}

impl Spot {
    pub fn new(
        index: LatticeIndex,
        predicted: Vector2,
        parallel_momentum: f64,
        cos_theta: f64,
    ) -> Self {
        Self {
            index,
            predicted,
            position: predicted,
            parallel_momentum,
            cos_theta,
            intensity: 0.0,
            signal_to_noise: 0.0,
            signal_to_background: 0.0,
            membership: Membership::default(),
            state: SpotState::Candidate,
        }
    }

    /// Move the spot back onto its prediction and clear the measurement.
    pub fn reset_to_predicted(&mut self) {
        self.position = self.predicted;
        self.intensity = 0.0;
        self.signal_to_noise = 0.0;
        self.signal_to_background = 0.0;
        self.state = SpotState::Candidate;
    }

    /// Distance in pixels between the refined and predicted positions.
    pub fn offset_from_predicted(&self) -> f64 {
        (self.position - self.predicted).norm()
    }

    pub fn is_gated(&self) -> bool {
        self.state == SpotState::Gated
    }
}
