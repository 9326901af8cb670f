//! Superstructure domains.
//!
//! A superstructure is described by the 2×2 matrix `M` relating its real-space
//! cell to the substrate cell. In reciprocal space the roles swap: the domain's
//! reflexes sit at the substrate indices
//!
//! ```text
//! (h, k) = (i·m11 + j·m21, i·m12 + j·m22),   m = M⁻¹,  i, j ∈ ℤ
//! ```
//!
//! e.g. a p(2×2) domain (`M = 2·I`) adds the half-order reflexes.

use serde::{Deserialize, Serialize};

use crate::error::{MkivError, Result};
use crate::spot::LatticeIndex;
use crate::Matrix2;

/// Matrices with `|det|` below this are rejected as singular.
const SINGULAR_DET: f64 = 1e-9;

/// A superstructure domain: its real-space matrix and the inverse used for
/// index generation. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[[f64; 2]; 2]", into = "[[f64; 2]; 2]")]
pub struct DomainTransform {
    matrix: Matrix2,
    inverse: Matrix2,
}

impl DomainTransform {
    /// Build from the row-major superstructure matrix.
    pub fn new(rows: [[f64; 2]; 2]) -> Result<Self> {
        let matrix = Matrix2::new(rows[0][0], rows[0][1], rows[1][0], rows[1][1]);
        let det = matrix.determinant();
        if !det.is_finite() || det.abs() < SINGULAR_DET {
            return Err(MkivError::InvalidConfig(format!(
                "superstructure matrix {rows:?} is singular"
            )));
        }
        let inverse = matrix.try_inverse().ok_or_else(|| {
            MkivError::InvalidConfig(format!("superstructure matrix {rows:?} is singular"))
        })?;
        Ok(Self { matrix, inverse })
    }

    /// `p(n×n)` domain.
    pub fn scaled(n: f64) -> Result<Self> {
        Self::new([[n, 0.0], [0.0, n]])
    }

    pub fn matrix(&self) -> &Matrix2 {
        &self.matrix
    }

    pub fn inverse(&self) -> &Matrix2 {
        &self.inverse
    }

    /// Substrate index of the domain reflex `(i, j)`.
    pub fn index(&self, i: i32, j: i32) -> LatticeIndex {
        let m = &self.inverse;
        let (i, j) = (f64::from(i), f64::from(j));
        LatticeIndex::new(i * m[(0, 0)] + j * m[(1, 0)], i * m[(0, 1)] + j * m[(1, 1)])
    }

    /// Smaller of the two row norms of the inverse: the shortest step a domain
    /// index makes in substrate units.
    pub fn min_inverse_row_norm(&self) -> f64 {
        let m = &self.inverse;
        let r1 = m[(0, 0)].hypot(m[(0, 1)]);
        let r2 = m[(1, 0)].hypot(m[(1, 1)]);
        r1.min(r2)
    }

    /// Ratio of the domain's reciprocal cell area to the substrate's.
    pub fn reciprocal_area_ratio(&self) -> f64 {
        self.inverse.determinant().abs()
    }

    fn rows(&self) -> [[f64; 2]; 2] {
        let m = &self.matrix;
        [[m[(0, 0)], m[(0, 1)]], [m[(1, 0)], m[(1, 1)]]]
    }
}

impl TryFrom<[[f64; 2]; 2]> for DomainTransform {
    type Error = MkivError;

    fn try_from(rows: [[f64; 2]; 2]) -> Result<Self> {
        Self::new(rows)
    }
}

impl From<DomainTransform> for [[f64; 2]; 2] {
    fn from(d: DomainTransform) -> Self {
        d.rows()
    }
}
