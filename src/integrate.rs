//! Spot intensity integration with a rotated elliptical aperture.
//!
//! The aperture is the ellipse `e(x, y) ≤ 1` with half-axes `(a, b)` rotated by
//! `φ`; the background is estimated from the concentric ring
//! `1 < e(x, y) ≤ ratio²`:
//!
//! ```text
//! e = x²·(cos²φ/a² + sin²φ/b²) + y²·(sin²φ/a² + cos²φ/b²) + xy·sinφ·cosφ·(2/a² − 2/b²)
//! ```
//!
//! With background subtraction the intensity is `Σsig − Σbg·n_sig/n_bg`. The
//! signal-to-noise figure is the signal-to-background ratio divided by the
//! relative background noise `σ_bg / mean_bg`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{Image, ScreenRegion};
use crate::spot::{Spot, SpotState, INTENSITY_SENTINEL};
use crate::Vector2;

/// Admissible `n_sig / n_bg` window; outside it the statistics are meaningless.
const BACKGROUND_NORM_RANGE: (f64, f64) = (0.05, 20.0);

/// Aperture shape and acceptance rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApertureConfig {
    /// Outer edge of the background ring in units of the aperture half-axes.
    /// Default: 1.5
    pub background_ratio: f64,

    /// Rotation of the aperture ellipse in degrees.
    /// Default: 0.0
    pub angle_deg: f64,

    /// A spot is out of frame when fewer than this fraction of its aperture
    /// pixels are on the frame and inside the mask.
    /// Default: 0.9
    pub min_signal_fraction: f64,

    /// Same rule for the background ring.
    /// Default: 0.7
    pub min_background_fraction: f64,

    /// Subtract the ring background from the aperture sum.
    /// Default: true
    pub subtract_background: bool,
}

impl Default for ApertureConfig {
    fn default() -> Self {
        Self {
            background_ratio: 1.5,
            angle_deg: 0.0,
            min_signal_fraction: 0.9,
            min_background_fraction: 0.7,
            subtract_background: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Signal,
    Background,
}

/// Pixel offsets of the aperture and its background ring.
#[derive(Debug, Clone)]
pub struct EllipseAperture {
    offsets: Vec<(i64, i64, Zone)>,
    n_signal: usize,
    n_background: usize,
}

impl EllipseAperture {
    /// Build the offset table for half-axes `half_axes` (pixels).
    pub fn new(half_axes: &Vector2, angle_deg: f64, background_ratio: f64) -> Self {
        let (a, b) = (half_axes.x, half_axes.y);
        let (s, c) = angle_deg.to_radians().sin_cos();
        let x_fac = (c / a).powi(2) + (s / b).powi(2);
        let y_fac = (s / a).powi(2) + (c / b).powi(2);
        let xy_fac = s * c * (2.0 / (a * a) - 2.0 / (b * b));
        let outer = background_ratio * background_ratio;
        let reach = (background_ratio * a.max(b)).round() as i64;

        let mut offsets = Vec::new();
        let (mut n_signal, mut n_background) = (0, 0);
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let (x, y) = (dx as f64, dy as f64);
                let e = x * x * x_fac + y * y * y_fac + x * y * xy_fac;
                if e <= 1.0 {
                    offsets.push((dx, dy, Zone::Signal));
                    n_signal += 1;
                } else if e <= outer {
                    offsets.push((dx, dy, Zone::Background));
                    n_background += 1;
                }
            }
        }
        Self {
            offsets,
            n_signal,
            n_background,
        }
    }

    pub fn signal_pixels(&self) -> usize {
        self.n_signal
    }

    pub fn background_pixels(&self) -> usize {
        self.n_background
    }

    /// Whether offset `(dx, dy)` lies in the signal ellipse.
    pub fn is_signal(&self, dx: i64, dy: i64) -> bool {
        self.offsets
            .iter()
            .any(|&(x, y, z)| x == dx && y == dy && z == Zone::Signal)
    }
}

/// Per-pass tallies for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrationSummary {
    pub gated: usize,
    pub measured: usize,
    pub out_of_frame: usize,
    pub degenerate: usize,
}

/// Integrates spot intensities on one frame.
pub struct IntensityIntegrator<'a> {
    config: &'a ApertureConfig,
    screen: &'a ScreenRegion,
}

#[derive(Default)]
struct Sums {
    n_sig: usize,
    sig: f64,
    n_bg: usize,
    bg: f64,
    bg2: f64,
}

impl<'a> IntensityIntegrator<'a> {
    pub fn new(config: &'a ApertureConfig, screen: &'a ScreenRegion) -> Self {
        Self { config, screen }
    }

    /// Integrate every spot that has not passed the S/N gate.
    ///
    /// Intensities are divided by `beam_current`. Spots whose S/N exceeds
    /// `threshold` become [`SpotState::Gated`], the rest [`SpotState::Measured`];
    /// spots clipped by the frame or mask become [`SpotState::OutOfFrame`].
    /// Spots with unusable background statistics keep their state and get the
    /// sentinel intensity.
    pub fn integrate(
        &self,
        spots: &mut [Spot],
        image: &Image,
        aperture: &EllipseAperture,
        beam_current: f64,
        threshold: f64,
    ) -> IntegrationSummary {
        let mut summary = IntegrationSummary::default();
        for spot in spots.iter_mut().filter(|s| !s.is_gated()) {
            spot.intensity = INTENSITY_SENTINEL;
            spot.signal_to_noise = 0.0;
            spot.signal_to_background = 0.0;

            let sums = self.accumulate(image, aperture, &spot.position);

            // ── Out-of-frame gate ──
            let sig_frac = sums.n_sig as f64 / aperture.n_signal.max(1) as f64;
            let bg_frac = sums.n_bg as f64 / aperture.n_background.max(1) as f64;
            if sig_frac < self.config.min_signal_fraction
                || bg_frac < self.config.min_background_fraction
            {
                spot.state = SpotState::OutOfFrame;
                summary.out_of_frame += 1;
                continue;
            }

            // ── Background statistics ──
            let b_norm = if sums.n_bg > 0 {
                sums.n_sig as f64 / sums.n_bg as f64
            } else {
                f64::INFINITY
            };
            if !(BACKGROUND_NORM_RANGE.0..=BACKGROUND_NORM_RANGE.1).contains(&b_norm)
                || sums.bg <= 0.0
            {
                debug!(
                    "Spot {}: unusable background (n_sig {}, n_bg {}, Σbg {:.1})",
                    spot.index, sums.n_sig, sums.n_bg, sums.bg
                );
                summary.degenerate += 1;
                continue;
            }
            let n_bg = sums.n_bg as f64;
            let noise = (n_bg * sums.bg2 - sums.bg * sums.bg).max(0.0).sqrt() / sums.bg;

            // ── Intensity and S/N ──
            let expected_bg = sums.bg * b_norm;
            let (intensity, s2u) = if self.config.subtract_background {
                let net = sums.sig - expected_bg;
                (net, net / expected_bg)
            } else {
                (sums.sig, sums.sig / expected_bg - 1.0)
            };
            let s2n = if noise > 0.0 {
                s2u / noise
            } else if s2u > 0.0 {
                f64::INFINITY
            } else {
                0.0
            };

            spot.intensity = intensity / beam_current;
            spot.signal_to_background = s2u;
            spot.signal_to_noise = s2n;
            if s2n > threshold {
                spot.state = SpotState::Gated;
                summary.gated += 1;
            } else {
                spot.state = SpotState::Measured;
                summary.measured += 1;
            }
        }
        debug!(
            "Integrated at S/N threshold {:.2}: {} gated, {} measured, {} out of frame, {} degenerate",
            threshold, summary.gated, summary.measured, summary.out_of_frame, summary.degenerate
        );
        summary
    }

    fn accumulate(&self, image: &Image, aperture: &EllipseAperture, center: &Vector2) -> Sums {
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;
        let mut sums = Sums::default();
        for &(dx, dy, zone) in &aperture.offsets {
            let (x, y) = (cx + dx, cy + dy);
            if !image.contains_pixel(x, y) {
                continue;
            }
            let (x, y) = (x as usize, y as usize);
            if !self.screen.pixel_allowed(x, y) {
                continue;
            }
            let v = f64::from(image.get(x, y));
            match zone {
                Zone::Signal => {
                    sums.n_sig += 1;
                    sums.sig += v;
                }
                Zone::Background => {
                    sums.n_bg += 1;
                    sums.bg += v;
                    sums.bg2 += v * v;
                }
            }
        }
        sums
    }
}
