//! Lattice estimation from indexed spot positions.
//!
//! Every spot triple `(i, j, k)` with non-degenerate index differences gives an
//! exact solution for the two basis vectors:
//!
//! ```text
//! [Δh₁ Δk₁] [b1]   [p_j − p_i]
//! [Δh₂ Δk₂] [b2] = [p_k − p_i]
//! ```
//!
//! The per-triple solutions are averaged, and the origin is the mean of
//! `p − h·b1 − k·b2` over all input spots. Triples are visited breadth-first over
//! the spots sorted by descending priority (S/N), so the `max_triples` cap keeps
//! the most trustworthy ones.

use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::combinations::BreadthFirstCombinations;
use crate::geometry::GeometryModel;
use crate::spot::LatticeIndex;
use crate::Vector2;

/// Configuration for the triple fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripleFitConfig {
    /// Minimum pixel separation between the spots of a triple (all three
    /// pairwise distances). The bootstrap fit uses a quarter of this.
    /// Default: 120.0
    pub min_separation: f64,

    /// Maximum number of valid triples averaged.
    /// Default: 599
    pub max_triples: usize,

    /// Triples with `|det|` of the index-difference matrix at or below this are
    /// skipped as ill-conditioned.
    /// Default: 0.3
    pub det_min: f64,

    /// Triples with `|det|` at or above this are skipped (spots too far apart in
    /// index space to share a reliable local geometry).
    /// Default: 20.0
    pub det_max: f64,
}

impl Default for TripleFitConfig {
    fn default() -> Self {
        Self {
            min_separation: 120.0,
            max_triples: 599,
            det_min: 0.3,
            det_max: 20.0,
        }
    }
}

/// How measured positions are mapped back onto the flat lattice before fitting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RadialCorrection {
    /// Positions are used as measured; no prior origin.
    None,
    /// Each position is expanded radially about `origin` by
    /// `1 + ratio·(1 − cos θ)`, undoing the enumerator's screen-curvature
    /// correction.
    FromSpots { ratio: f64, origin: Vector2 },
    /// All positions are expanded about `origin` by the same factor.
    Fixed { factor: f64, origin: Vector2 },
}

impl RadialCorrection {
    fn apply(&self, point: &FitPoint) -> Vector2 {
        match *self {
            RadialCorrection::None => point.position,
            RadialCorrection::FromSpots { ratio, origin } => {
                origin + (point.position - origin) * (1.0 + ratio * (1.0 - point.cos_theta))
            }
            RadialCorrection::Fixed { factor, origin } => {
                origin + (point.position - origin) * factor
            }
        }
    }
}

/// One indexed observation fed to the fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitPoint {
    pub index: LatticeIndex,
    pub position: Vector2,
    /// Emergence-angle cosine, used by [`RadialCorrection::FromSpots`].
    pub cos_theta: f64,
    /// Higher first when forming triples.
    pub priority: f64,
}

/// Origin and basis estimated by a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeEstimate {
    pub origin: Vector2,
    pub basis1: Vector2,
    pub basis2: Vector2,
}

/// Outcome of a triple fit.
#[derive(Debug, Clone, PartialEq)]
pub struct TripleFitResult {
    /// `None` when no triple passed the filters.
    pub estimate: Option<LatticeEstimate>,
    /// Number of triples averaged.
    pub triples_used: usize,
    /// Number of triples examined (valid or not).
    pub triples_tried: usize,
}

/// Estimates a lattice candidate from the spots selected for recalibration.
///
/// The controller is generic over this so a different estimator can be swapped
/// in without touching the frame loop.
pub trait BasisEstimator {
    fn estimate(&self, points: &[FitPoint], model: &GeometryModel) -> TripleFitResult;
}

/// Default estimator: triple fit with radial correction about the current
/// origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TripleFit {
    pub config: TripleFitConfig,
    /// Screen-curvature ratio, the same value the enumerator uses.
    pub ratio: f64,
    /// Use one expansion factor for every spot instead of the per-spot
    /// `1 + ratio·(1 − cos θ)`.
    pub fixed_factor: Option<f64>,
}

impl BasisEstimator for TripleFit {
    fn estimate(&self, points: &[FitPoint], model: &GeometryModel) -> TripleFitResult {
        let correction = match self.fixed_factor {
            Some(factor) => RadialCorrection::Fixed {
                factor,
                origin: model.origin,
            },
            None => RadialCorrection::FromSpots {
                ratio: self.ratio,
                origin: model.origin,
            },
        };
        fit_lattice(points, &self.config, correction)
    }
}

/// Fit origin and basis vectors to `points`.
pub fn fit_lattice(
    points: &[FitPoint],
    config: &TripleFitConfig,
    correction: RadialCorrection,
) -> TripleFitResult {
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        points[b]
            .priority
            .partial_cmp(&points[a].priority)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let corrected: Vec<Vector2> = order.iter().map(|&i| correction.apply(&points[i])).collect();
    let indices: Vec<LatticeIndex> = order.iter().map(|&i| points[i].index).collect();

    let mut sum1 = Vector2::zeros();
    let mut sum2 = Vector2::zeros();
    let mut used = 0usize;
    let mut tried = 0usize;

    for [i, j, k] in BreadthFirstCombinations::<3>::new(points.len()) {
        if used >= config.max_triples {
            break;
        }
        tried += 1;
        let Some((b1, b2)) = solve_triple(
            [&corrected[i], &corrected[j], &corrected[k]],
            [&indices[i], &indices[j], &indices[k]],
            config,
        ) else {
            continue;
        };
        sum1 += b1;
        sum2 += b2;
        used += 1;
    }

    if used == 0 {
        debug!(
            "Triple fit: none of {} triples from {} spots usable",
            tried,
            points.len()
        );
        return TripleFitResult {
            estimate: None,
            triples_used: 0,
            triples_tried: tried,
        };
    }

    let basis1 = sum1 / used as f64;
    let basis2 = sum2 / used as f64;
    let origin = corrected
        .iter()
        .zip(&indices)
        .map(|(p, ind)| p - ind.offset(&basis1, &basis2))
        .sum::<Vector2>()
        / corrected.len() as f64;

    debug!(
        "Triple fit: {}/{} triples, origin=({:.2}, {:.2}) a1=({:.3}, {:.3}) a2=({:.3}, {:.3})",
        used, tried, origin.x, origin.y, basis1.x, basis1.y, basis2.x, basis2.y
    );

    TripleFitResult {
        estimate: Some(LatticeEstimate {
            origin,
            basis1,
            basis2,
        }),
        triples_used: used,
        triples_tried: tried,
    }
}

/// Exact basis for one triple, or `None` when the triple is degenerate.
fn solve_triple(
    pos: [&Vector2; 3],
    ind: [&LatticeIndex; 3],
    config: &TripleFitConfig,
) -> Option<(Vector2, Vector2)> {
    let d1 = pos[1] - pos[0];
    let d2 = pos[2] - pos[0];
    if d1.norm() < config.min_separation
        || d2.norm() < config.min_separation
        || (d1 - d2).norm() < config.min_separation
    {
        return None;
    }

    let dh1 = ind[1].h - ind[0].h;
    let dk1 = ind[1].k - ind[0].k;
    let dh2 = ind[2].h - ind[0].h;
    let dk2 = ind[2].k - ind[0].k;
    let det = dh1 * dk2 - dk1 * dh2;
    if det.abs() <= config.det_min || det.abs() >= config.det_max {
        return None;
    }

    // Rows of `deltas` are the position differences; rows of the product are b1, b2.
    let inv = Matrix2::new(dh1, dk1, dh2, dk2).try_inverse()?;
    let deltas = Matrix2::new(d1.x, d1.y, d2.x, d2.y);
    let basis = inv * deltas;
    Some((
        Vector2::new(basis[(0, 0)], basis[(0, 1)]),
        Vector2::new(basis[(1, 0)], basis[(1, 1)]),
    ))
}
