//! Enumeration of the reflexes expected on the screen at the current energy.
//!
//! The pattern is the Ewald construction projected onto the screen: a reflex
//! at reciprocal offset `r` emerges at `sin θ = |r| / R`, where the screen radius
//! `R = |basis1| / sin θ₁₀` follows from the (1, 0) beam's emergence angle.
//! Reflexes with `|r| > R` are evanescent. The curved screen pulls outer
//! reflexes inwards, approximated by `r / (1 + ratio·(1 − cos θ))`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::domain::DomainTransform;
use crate::error::{MkivError, Result};
use crate::frame::ScreenRegion;
use crate::geometry::GeometryModel;
use crate::spot::{LatticeIndex, Spot};
use crate::Vector2;

/// `ħ/sqrt(2mₑ)` in eV^½·Å: `k[Å⁻¹] = sqrt(E[eV]) / H2M`.
pub const H2M: f64 = 1.951939668076095;

/// Energy-to-screen mapping of the lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    /// Screen-curvature ratio for the radial correction.
    /// Default: 0.22
    pub ratio: f64,

    /// Parallel momentum of the (1, 0) substrate reflex in Å⁻¹.
    /// Default: 2.6771
    pub kpl_10: f64,

    /// Energy (eV) at which the spot-list capacity is evaluated. Spot density
    /// grows with energy, so this should be the top of the ramp.
    /// Default: 1000.0
    pub capacity_energy: f64,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            ratio: 0.22,
            kpl_10: 2.6771,
            capacity_energy: 1000.0,
        }
    }
}

/// Screen radius `R` in pixels for `model` at its reference energy.
pub fn ewald_radius(model: &GeometryModel, kpl_10: f64) -> f64 {
    let sin_theta_10 = kpl_10 * H2M / model.reference_energy.sqrt();
    model.basis1.norm() / sin_theta_10
}

/// Upper bound on the number of reflexes on a `width × height` frame for
/// `model` rescaled to `energy`: substrate plus every domain, each from the
/// area of the inscribed ellipse over the reciprocal cell area.
pub fn spot_capacity(
    model: &GeometryModel,
    domains: &[DomainTransform],
    width: u32,
    height: u32,
    energy: f64,
) -> Result<usize> {
    let mut scaled = model.clone();
    scaled.rescale(energy)?;
    let screen_area = std::f64::consts::FRAC_PI_4 * f64::from(width) * f64::from(height);
    let cell = scaled.cell_area();
    let per_cell = |area: f64| (screen_area / area).ceil() as usize + 1;

    let mut capacity = per_cell(cell);
    for d in domains {
        capacity += per_cell(cell * d.reciprocal_area_ratio());
    }
    Ok(capacity)
}

/// Builds the per-frame candidate list.
pub struct SpotEnumerator<'a> {
    config: &'a LatticeConfig,
    domains: &'a [DomainTransform],
    excluded: &'a [LatticeIndex],
    screen: &'a ScreenRegion,
    capacity: usize,
}

impl<'a> SpotEnumerator<'a> {
    pub fn new(
        config: &'a LatticeConfig,
        domains: &'a [DomainTransform],
        excluded: &'a [LatticeIndex],
        screen: &'a ScreenRegion,
        capacity: usize,
    ) -> Self {
        Self {
            config,
            domains,
            excluded,
            screen,
            capacity,
        }
    }

    /// Every visible substrate and domain reflex on a `width × height` frame,
    /// deduplicated, without excluded indices, sorted by increasing |k∥|.
    ///
    /// Fails with [`MkivError::TooManySpots`] when more than `capacity`
    /// reflexes survive.
    pub fn enumerate(&self, model: &GeometryModel, width: u32, height: u32) -> Result<Vec<Spot>> {
        let radius = ewald_radius(model, self.config.kpl_10);
        let min_len = model.basis1.norm().min(model.basis2.norm());
        let order = (radius / min_len).floor() as i32 + 1;

        let mut spots: Vec<Spot> = Vec::new();

        // ── Substrate ──
        for i in -order..=order {
            for j in -order..=order {
                let index = LatticeIndex::new(f64::from(i), f64::from(j));
                self.try_push(&mut spots, model, radius, index, width, height);
            }
        }

        // ── Superstructure domains ──
        for domain in self.domains {
            let domain_order = (f64::from(order) / domain.min_inverse_row_norm()).floor() as i32 + 1;
            for i in -domain_order..=domain_order {
                for j in -domain_order..=domain_order {
                    self.try_push(&mut spots, model, radius, domain.index(i, j), width, height);
                }
            }
        }

        if spots.len() > self.capacity {
            return Err(MkivError::TooManySpots {
                count: spots.len(),
                capacity: self.capacity,
            });
        }

        spots.sort_by(|a, b| {
            a.parallel_momentum
                .partial_cmp(&b.parallel_momentum)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            "Enumerated {} spots at {:.1} eV (R = {:.1} px, order {})",
            spots.len(),
            model.reference_energy,
            radius,
            order
        );
        Ok(spots)
    }

    /// Append the reflex at `index` when it is on screen, not excluded and not
    /// already listed. The first occurrence of an index wins.
    fn try_push(
        &self,
        spots: &mut Vec<Spot>,
        model: &GeometryModel,
        radius: f64,
        index: LatticeIndex,
        width: u32,
        height: u32,
    ) {
        let r = index.offset(&model.basis1, &model.basis2);
        let len = r.norm();
        if len > radius {
            return;
        }
        let sin_theta = len / radius;
        let cos_theta = (1.0 - sin_theta * sin_theta).max(0.0).sqrt();
        let corrected = r / (1.0 + self.config.ratio * (1.0 - cos_theta));
        let predicted: Vector2 = model.origin + corrected;

        if predicted.x < 0.0
            || predicted.y < 0.0
            || predicted.x >= f64::from(width)
            || predicted.y >= f64::from(height)
        {
            return;
        }
        if !self.screen.is_visible(&predicted, model.search_range) {
            return;
        }
        if self.excluded.iter().any(|e| e.matches(&index)) {
            return;
        }
        if spots.iter().any(|s| s.index.matches(&index)) {
            return;
        }

        let parallel_momentum = self.config.kpl_10 / model.basis1.norm() * corrected.norm();
        spots.push(Spot::new(index, predicted, parallel_momentum, cos_theta));
    }
}
