//! Run configuration.
//!
//! [`RunConfig`] gathers the per-stage settings. Every field has a default, so a
//! JSON file only needs the values that differ:
//!
//! ```json
//! {
//!   "screen": { "center": [240.0, 256.0], "outer_radius": 220.0 },
//!   "indices": { "desired": [{ "h": 1.0, "k": 0.0 }, { "h": 0.5, "k": 0.5 }] },
//!   "domains": [[[0.5, 0.5], [-0.5, 0.5]]],
//!   "beam": { "mode": "smoothed", "window": 10 }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::beam::BeamCurrentMode;
use crate::calibration::{RecalibrationConfig, SearchConfig};
use crate::error::{MkivError, Result};
use crate::frame::ScreenConfig;
use crate::geometry::GeometryConfig;
use crate::integrate::ApertureConfig;
use crate::lattice::{DomainTransform, LatticeConfig};
use crate::spot::LatticeIndex;

/// The three index lists of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexLists {
    /// Reflexes whose intensities go into the I(V) table, in column order.
    pub desired: Vec<LatticeIndex>,
    /// Reflexes preferred for recalibration.
    pub reference: Vec<LatticeIndex>,
    /// Reflexes never tracked.
    pub excluded: Vec<LatticeIndex>,
}

/// Complete configuration of a tracking run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub screen: ScreenConfig,
    pub geometry: GeometryConfig,
    pub lattice: LatticeConfig,
    /// Superstructure domain matrices.
    pub domains: Vec<DomainTransform>,
    pub indices: IndexLists,
    pub search: SearchConfig,
    pub aperture: ApertureConfig,
    pub recalibration: RecalibrationConfig,
    pub beam: BeamCurrentMode,
}

fn invalid(msg: impl Into<String>) -> MkivError {
    MkivError::InvalidConfig(msg.into())
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(invalid(msg()))
    }
}

impl RunConfig {
    /// Reject out-of-range and inconsistent values.
    pub fn validate(&self) -> Result<()> {
        // ── Screen ──
        let s = &self.screen;
        ensure(s.inner_radius >= 0.0, || {
            format!("screen.inner_radius must be >= 0, got {}", s.inner_radius)
        })?;
        ensure(s.outer_radius > s.inner_radius, || {
            format!(
                "screen.outer_radius ({}) must exceed inner_radius ({})",
                s.outer_radius, s.inner_radius
            )
        })?;

        // ── Geometry ──
        let g = &self.geometry;
        ensure(g.relative_range > 0.0 && g.range_min > 0.0, || {
            format!(
                "geometry ranges must be positive, got relative_range {} range_min {}",
                g.relative_range, g.range_min
            )
        })?;
        ensure(
            g.relative_aperture.x > 0.0 && g.relative_aperture.y > 0.0 && g.aperture_min > 0.0,
            || "geometry aperture scales must be positive".to_string(),
        )?;
        ensure(g.min_basis_sine > 0.0 && g.min_basis_sine < 1.0, || {
            format!("geometry.min_basis_sine must lie in (0, 1), got {}", g.min_basis_sine)
        })?;

        // ── Lattice ──
        let l = &self.lattice;
        ensure(l.kpl_10 > 0.0, || format!("lattice.kpl_10 must be positive, got {}", l.kpl_10))?;
        ensure(l.capacity_energy > 0.0, || {
            format!("lattice.capacity_energy must be positive, got {}", l.capacity_energy)
        })?;
        ensure(l.ratio >= 0.0, || format!("lattice.ratio must be >= 0, got {}", l.ratio))?;

        // ── Search ──
        let sr = &self.search;
        ensure(sr.step >= 1, || "search.step must be at least 1".to_string())?;
        ensure(sr.retry_divisor > 0.0, || {
            format!("search.retry_divisor must be positive, got {}", sr.retry_divisor)
        })?;
        sr.kernel.validate()?;

        // ── Aperture ──
        let a = &self.aperture;
        ensure(a.background_ratio > 1.0, || {
            format!("aperture.background_ratio must exceed 1, got {}", a.background_ratio)
        })?;
        for (name, v) in [
            ("min_signal_fraction", a.min_signal_fraction),
            ("min_background_fraction", a.min_background_fraction),
        ] {
            ensure((0.0..=1.0).contains(&v), || {
                format!("aperture.{name} must lie in [0, 1], got {v}")
            })?;
        }

        // ── Recalibration ──
        let r = &self.recalibration;
        ensure(r.cos_min <= r.cos_max, || {
            format!(
                "recalibration.cos_min ({}) exceeds cos_max ({})",
                r.cos_min, r.cos_max
            )
        })?;
        ensure(r.fit.det_min < r.fit.det_max, || {
            format!(
                "recalibration.fit.det_min ({}) must be below det_max ({})",
                r.fit.det_min, r.fit.det_max
            )
        })?;
        ensure(r.fit.max_triples >= 1, || {
            "recalibration.fit.max_triples must be at least 1".to_string()
        })?;
        ensure(r.fit.min_separation >= 0.0, || {
            "recalibration.fit.min_separation must be >= 0".to_string()
        })?;
        if let Some(f) = r.fixed_correction {
            ensure(f > 0.0, || {
                format!("recalibration.fixed_correction must be positive, got {f}")
            })?;
        }
        let p = &r.acceptance;
        ensure((0.0..=1.0).contains(&p.blend_factor), || {
            format!("acceptance.blend_factor must lie in [0, 1], got {}", p.blend_factor)
        })?;
        ensure(p.max_deviation > 0.0, || {
            format!("acceptance.max_deviation must be positive, got {}", p.max_deviation)
        })?;

        // ── Beam current ──
        match self.beam {
            BeamCurrentMode::Raw => {}
            BeamCurrentMode::Smoothed { window } => {
                ensure(window >= 1, || "beam smoothing window must be at least 1".to_string())?
            }
            BeamCurrentMode::Fixed { value } => ensure(value > 0.0 && value.is_finite(), || {
                format!("fixed beam current must be positive, got {value}")
            })?,
        }

        Ok(())
    }

    /// Read a JSON configuration and validate it.
    pub fn load_from_file(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: RunConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!(
            "Loaded config {}: {} desired, {} reference, {} excluded, {} domains",
            path.display(),
            config.indices.desired.len(),
            config.indices.reference.len(),
            config.indices.excluded.len(),
            config.domains.len()
        );
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> AnyResult<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

/// Longest ramp [`EnergyRamp::new`] accepts.
pub const MAX_RAMP_FRAMES: usize = 1_000_000;

/// Frame energies of a linear ramp, `start` to `stop` inclusive.
///
/// `step` is taken as a magnitude; its direction follows `stop - start`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyRamp {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl EnergyRamp {
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self> {
        for e in [start, stop] {
            if !(e.is_finite() && e > 0.0) {
                return Err(MkivError::InvalidEnergy { energy: e });
            }
        }
        if !(step.is_finite() && step != 0.0) {
            return Err(invalid(format!("energy step must be non-zero, got {step}")));
        }
        let ramp = Self { start, stop, step };
        if ramp.intervals() >= MAX_RAMP_FRAMES as f64 {
            return Err(invalid(format!(
                "energy step {step} gives more than {MAX_RAMP_FRAMES} frames from {start} to {stop} eV"
            )));
        }
        Ok(ramp)
    }

    /// Number of frames in the ramp.
    pub fn len(&self) -> usize {
        self.intervals() as usize + 1
    }

    fn intervals(&self) -> f64 {
        // Tolerance for rounding of the end point.
        ((self.stop - self.start).abs() / self.step.abs() + 1e-6).floor()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Energies in acquisition order.
    pub fn energies(&self) -> impl Iterator<Item = f64> + '_ {
        let signed = if self.stop >= self.start {
            self.step.abs()
        } else {
            -self.step.abs()
        };
        (0..self.len()).map(move |i| self.start + i as f64 * signed)
    }
}
