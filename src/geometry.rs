//! Reciprocal-lattice geometry model: origin, two basis vectors and the
//! energy-scaled search and aperture sizes derived from them.
//!
//! # Energy scaling
//!
//! On a flat-projected screen the distance between reflexes scales with the
//! electron wavelength, i.e. with `1 / sqrt(E)`. Rescaling from `E₀` to `E`
//! multiplies both basis vectors by `sqrt(E₀ / E)`; the origin (specular beam)
//! does not move.
//!
//! ```text
//! predicted(h, k) = origin + h · basis1 + k · basis2      (before radial correction)
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::fit::{fit_lattice, FitPoint, LatticeEstimate, RadialCorrection, TripleFitConfig};
use crate::error::{MkivError, Result};
use crate::spot::LatticeIndex;
use crate::Vector2;

/// Sizing rules for the peak search window and integration aperture.
///
/// Both scale with `|basis1|` so they stay proportional to the spot spacing
/// as the pattern contracts with rising energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Peak search radius as a fraction of `|basis1|`.
    /// Default: 0.045
    pub relative_range: f64,

    /// Lower bound of the peak search radius in pixels.
    /// Default: 3.0
    pub range_min: f64,

    /// Aperture half-axes as fractions of `|basis1|`.
    /// Default: (0.055, 0.055)
    pub relative_aperture: Vector2,

    /// The aperture diagonal `hypot(a, b)` is kept at or above
    /// `aperture_min · √2` pixels; both half-axes are scaled together.
    /// Default: 3.0
    pub aperture_min: f64,

    /// Smallest accepted `|sin|` of the angle between the basis vectors.
    /// Default: 1e-3
    pub min_basis_sine: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            relative_range: 0.045,
            range_min: 3.0,
            relative_aperture: Vector2::new(0.055, 0.055),
            aperture_min: 3.0,
            min_basis_sine: 1e-3,
        }
    }
}

/// An operator-identified spot used to bootstrap the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManualSpot {
    pub index: LatticeIndex,
    pub position: Vector2,
}

impl ManualSpot {
    pub fn new(h: f64, k: f64, x: f64, y: f64) -> Self {
        Self {
            index: LatticeIndex::new(h, k),
            position: Vector2::new(x, y),
        }
    }
}

/// Current lattice geometry on the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryModel {
    /// Pixel position of the (0, 0) reflex.
    pub origin: Vector2,
    pub basis1: Vector2,
    pub basis2: Vector2,
    /// Energy (eV) at which the basis vectors are valid.
    pub reference_energy: f64,
    /// Peak search radius in pixels. Derived.
    pub search_range: f64,
    /// Aperture half-axes in pixels. Derived.
    pub aperture: Vector2,
    config: GeometryConfig,
}

impl GeometryModel {
    /// Build a model from explicit vectors, validating the energy and basis.
    pub fn new(
        origin: Vector2,
        basis1: Vector2,
        basis2: Vector2,
        energy: f64,
        config: GeometryConfig,
    ) -> Result<Self> {
        check_energy(energy)?;
        check_basis(&basis1, &basis2, config.min_basis_sine)?;
        let mut model = Self {
            origin,
            basis1,
            basis2,
            reference_energy: energy,
            search_range: 0.0,
            aperture: Vector2::zeros(),
            config,
        };
        model.update_derived();
        Ok(model)
    }

    /// Bootstrap a model from at least three operator-identified spots at `energy`.
    ///
    /// The triple fit runs without radial correction and with a quarter of the
    /// configured minimum separation.
    pub fn initialize_from_spots(
        spots: &[ManualSpot],
        energy: f64,
        config: GeometryConfig,
        fit_config: &TripleFitConfig,
    ) -> Result<Self> {
        check_energy(energy)?;
        if spots.len() < 3 {
            return Err(MkivError::TooFewReferenceSpots { count: spots.len() });
        }

        let points: Vec<FitPoint> = spots
            .iter()
            .map(|s| FitPoint {
                index: s.index,
                position: s.position,
                cos_theta: 1.0,
                priority: 0.0,
            })
            .collect();
        let bootstrap_config = TripleFitConfig {
            min_separation: fit_config.min_separation / 4.0,
            ..fit_config.clone()
        };
        let fit = fit_lattice(&points, &bootstrap_config, RadialCorrection::None);
        let estimate = fit
            .estimate
            .ok_or(MkivError::NoValidTriples { spots: spots.len() })?;
        debug!(
            "Bootstrap from {} spots, {} triples: origin=({:.2}, {:.2}) a1=({:.2}, {:.2}) a2=({:.2}, {:.2})",
            spots.len(),
            fit.triples_used,
            estimate.origin.x,
            estimate.origin.y,
            estimate.basis1.x,
            estimate.basis1.y,
            estimate.basis2.x,
            estimate.basis2.y
        );
        Self::new(
            estimate.origin,
            estimate.basis1,
            estimate.basis2,
            energy,
            config,
        )
    }

    pub fn config(&self) -> &GeometryConfig {
        &self.config
    }

    /// Scale the basis to `new_energy` and recompute the derived sizes.
    pub fn rescale(&mut self, new_energy: f64) -> Result<()> {
        check_energy(new_energy)?;
        let factor = (self.reference_energy / new_energy).sqrt();
        self.basis1 *= factor;
        self.basis2 *= factor;
        self.reference_energy = new_energy;
        self.update_derived();
        Ok(())
    }

    /// Uncorrected position of `index`.
    pub fn project(&self, index: &LatticeIndex) -> Vector2 {
        self.origin + index.offset(&self.basis1, &self.basis2)
    }

    /// Area of the reciprocal unit cell in square pixels.
    pub fn cell_area(&self) -> f64 {
        cross(&self.basis1, &self.basis2).abs()
    }

    /// Shift of origin, basis1 and basis2 (pixels) between this model and
    /// `candidate`.
    pub fn deviations(&self, candidate: &LatticeEstimate) -> [f64; 3] {
        [
            (candidate.origin - self.origin).norm(),
            (candidate.basis1 - self.basis1).norm(),
            (candidate.basis2 - self.basis2).norm(),
        ]
    }

    /// Move the model towards `candidate`: `new = (1 − f)·old + f·candidate`.
    ///
    /// Returns `false` and leaves the model untouched when the blended basis
    /// would be degenerate.
    pub fn blend(&mut self, candidate: &LatticeEstimate, factor: f64) -> bool {
        let mix = |old: &Vector2, new: &Vector2| old * (1.0 - factor) + new * factor;
        let basis1 = mix(&self.basis1, &candidate.basis1);
        let basis2 = mix(&self.basis2, &candidate.basis2);
        if check_basis(&basis1, &basis2, self.config.min_basis_sine).is_err() {
            return false;
        }
        self.origin = mix(&self.origin, &candidate.origin);
        self.basis1 = basis1;
        self.basis2 = basis2;
        self.update_derived();
        true
    }

    fn update_derived(&mut self) {
        let len = self.basis1.norm();
        self.search_range = (self.config.relative_range * len).max(self.config.range_min);

        let mut aperture = self.config.relative_aperture * len;
        let min_diag = self.config.aperture_min * std::f64::consts::SQRT_2;
        let diag = aperture.x.hypot(aperture.y);
        if diag <= 0.0 {
            aperture = Vector2::new(self.config.aperture_min, self.config.aperture_min);
        } else if diag < min_diag {
            aperture *= min_diag / diag;
        }
        self.aperture = aperture;
    }
}

/// z-component of the 2D cross product.
#[inline]
pub(crate) fn cross(a: &Vector2, b: &Vector2) -> f64 {
    a.x * b.y - a.y * b.x
}

fn check_energy(energy: f64) -> Result<()> {
    if energy.is_finite() && energy > 0.0 {
        Ok(())
    } else {
        Err(MkivError::InvalidEnergy { energy })
    }
}

fn check_basis(basis1: &Vector2, basis2: &Vector2, min_sine: f64) -> Result<()> {
    let norms = basis1.norm() * basis2.norm();
    let sin_angle = if norms > 0.0 {
        cross(basis1, basis2) / norms
    } else {
        0.0
    };
    if !sin_angle.is_finite() || sin_angle.abs() < min_sine {
        return Err(MkivError::DegenerateBasis { sin_angle });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_model() -> GeometryModel {
        GeometryModel::new(
            Vector2::new(50.0, 50.0),
            Vector2::new(10.0, 0.0),
            Vector2::new(0.0, 10.0),
            100.0,
            GeometryConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_rescale_roundtrip_restores_vectors() {
        let mut model = square_model();
        let original = model.clone();
        for e in [37.0, 150.0, 399.5, 1000.0] {
            model.rescale(e).unwrap();
            model.rescale(100.0).unwrap();
            assert!(
                (model.basis1 - original.basis1).norm() < 1e-9,
                "basis1 drifted after rescale via {e} eV"
            );
            assert!((model.basis2 - original.basis2).norm() < 1e-9);
            assert_eq!(model.origin, original.origin);
            assert!((model.search_range - original.search_range).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rescale_follows_sqrt_law() {
        let mut model = square_model();
        model.rescale(400.0).unwrap();
        assert!((model.basis1.x - 5.0).abs() < 1e-12);
        assert!((model.basis2.y - 5.0).abs() < 1e-12);
        assert_eq!(model.reference_energy, 400.0);
    }

    #[test]
    fn test_rescale_rejects_bad_energy() {
        let mut model = square_model();
        for e in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                model.rescale(e),
                Err(MkivError::InvalidEnergy { .. })
            ));
        }
        assert_eq!(model.reference_energy, 100.0);
    }

    #[test]
    fn test_derived_sizes_clamped() {
        // |basis1| = 10: 0.045·10 < 3 → range clamped to 3
        let model = square_model();
        assert!((model.search_range - 3.0).abs() < 1e-12);
        // 0.055·10 per axis is far below the 3·√2 diagonal → scaled up to (3, 3)
        assert!((model.aperture.x - 3.0).abs() < 1e-9);
        assert!((model.aperture.y - 3.0).abs() < 1e-9);

        let big = GeometryModel::new(
            Vector2::zeros(),
            Vector2::new(200.0, 0.0),
            Vector2::new(0.0, 200.0),
            100.0,
            GeometryConfig {
                relative_aperture: Vector2::new(0.06, 0.03),
                ..Default::default()
            },
        )
        .unwrap();
        assert!((big.search_range - 9.0).abs() < 1e-9);
        assert!((big.aperture.x - 12.0).abs() < 1e-9);
        assert!((big.aperture.y - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_aperture_clamp_keeps_aspect() {
        let model = GeometryModel::new(
            Vector2::zeros(),
            Vector2::new(10.0, 0.0),
            Vector2::new(0.0, 10.0),
            100.0,
            GeometryConfig {
                relative_aperture: Vector2::new(0.1, 0.05),
                ..Default::default()
            },
        )
        .unwrap();
        let diag = model.aperture.x.hypot(model.aperture.y);
        assert!((diag - 3.0 * std::f64::consts::SQRT_2).abs() < 1e-9);
        assert!((model.aperture.x / model.aperture.y - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_basis_rejected() {
        let err = GeometryModel::new(
            Vector2::zeros(),
            Vector2::new(10.0, 0.0),
            Vector2::new(20.0, 0.001),
            100.0,
            GeometryConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MkivError::DegenerateBasis { .. }));
    }

    #[test]
    fn test_initialize_from_exact_spots() {
        let spots = [
            ManualSpot::new(1.0, 0.0, 60.0, 50.0),
            ManualSpot::new(0.0, 1.0, 50.0, 60.0),
            ManualSpot::new(-1.0, 0.0, 40.0, 50.0),
            ManualSpot::new(1.0, 1.0, 60.0, 60.0),
        ];
        let fit = TripleFitConfig {
            min_separation: 8.0,
            ..Default::default()
        };
        let model =
            GeometryModel::initialize_from_spots(&spots, 100.0, GeometryConfig::default(), &fit)
                .unwrap();
        assert!((model.origin - Vector2::new(50.0, 50.0)).norm() < 1e-9);
        assert!((model.basis1 - Vector2::new(10.0, 0.0)).norm() < 1e-9);
        assert!((model.basis2 - Vector2::new(0.0, 10.0)).norm() < 1e-9);
    }

    #[test]
    fn test_initialize_needs_three_spots() {
        let spots = [
            ManualSpot::new(1.0, 0.0, 60.0, 50.0),
            ManualSpot::new(0.0, 1.0, 50.0, 60.0),
        ];
        let err = GeometryModel::initialize_from_spots(
            &spots,
            100.0,
            GeometryConfig::default(),
            &TripleFitConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, MkivError::TooFewReferenceSpots { count: 2 });
    }

    #[test]
    fn test_initialize_without_valid_triple() {
        // Collinear indices give a zero determinant for every triple
        let spots = [
            ManualSpot::new(1.0, 0.0, 60.0, 50.0),
            ManualSpot::new(2.0, 0.0, 70.0, 50.0),
            ManualSpot::new(3.0, 0.0, 80.0, 50.0),
        ];
        let fit = TripleFitConfig {
            min_separation: 4.0,
            ..Default::default()
        };
        let err =
            GeometryModel::initialize_from_spots(&spots, 100.0, GeometryConfig::default(), &fit)
                .unwrap_err();
        assert_eq!(err, MkivError::NoValidTriples { spots: 3 });
    }

    #[test]
    fn test_blend_moves_towards_candidate() {
        let mut model = square_model();
        let candidate = LatticeEstimate {
            origin: Vector2::new(52.0, 50.0),
            basis1: Vector2::new(11.0, 0.0),
            basis2: Vector2::new(0.0, 10.0),
        };
        let dev = model.deviations(&candidate);
        assert!((dev[0] - 2.0).abs() < 1e-12);
        assert!((dev[1] - 1.0).abs() < 1e-12);
        assert!(dev[2].abs() < 1e-12);

        assert!(model.blend(&candidate, 0.7));
        assert!((model.origin.x - 51.4).abs() < 1e-12);
        assert!((model.basis1.x - 10.7).abs() < 1e-12);
    }

    #[test]
    fn test_blend_refuses_degenerate_result() {
        let mut model = square_model();
        let candidate = LatticeEstimate {
            origin: Vector2::new(50.0, 50.0),
            basis1: Vector2::new(10.0, 0.0),
            basis2: Vector2::new(10.0, 0.0),
        };
        let before = model.clone();
        assert!(!model.blend(&candidate, 1.0));
        assert_eq!(model, before);
    }
}
