//! # mkiv
//!
//! **LEED spot tracking** and reciprocal-lattice calibration for I(V) measurements,
//! written in Rust.
//!
//! Given a series of low-energy electron diffraction frames taken while the beam
//! energy is ramped, `mkiv` follows every diffraction spot across the series and
//! integrates its intensity, producing one I(V) curve per requested reflex. The
//! projected reciprocal lattice is re-fitted to the measured spots on every frame,
//! so the tracker follows drift of the sample and the optics without operator
//! intervention.
//!
//! ## Features
//!
//! - **Energy scaling**: the projected lattice contracts as `1/√E`, so positions at
//!   the next energy are predicted from the current one
//! - **Superstructures**: any number of domain matrices add fractional-order spots
//! - **Peak search**: weighted local maximum plus centroid, with a narrower retry pass
//!   for weak spots
//! - **Background-subtracted integration** in elliptical apertures with an S/N gate
//! - **Self-calibration**: origin and basis re-fitted from spot triples every frame,
//!   with a deviation limit and bounded repetition of rejected frames
//! - **Beam-current normalisation**: raw, smoothed or constant
//! - **Output**: the classic `ivdat` layout and CSV
//!
//! ## Example
//!
//! ```no_run
//! use mkiv::{CalibrationController, EnergyRamp, Frame, Image, LatticeIndex, ManualSpot, RunConfig};
//!
//! let mut config = RunConfig::load_from_file("run.json").unwrap();
//! config.indices.desired = vec![LatticeIndex::new(1.0, 0.0), LatticeIndex::new(1.0, 1.0)];
//!
//! // Spots identified by hand on the first frame
//! let manual = [
//!     ManualSpot::new(1.0, 0.0, 310.2, 251.7),
//!     ManualSpot::new(0.0, 1.0, 249.1, 312.0),
//!     ManualSpot::new(-1.0, 0.0, 189.6, 248.9),
//!     ManualSpot::new(0.0, -1.0, 250.3, 190.4),
//! ];
//! let controller = CalibrationController::bootstrap(config, None, &manual, 100.0, (512, 512)).unwrap();
//!
//! let ramp = EnergyRamp::new(100.0, 300.0, 1.0).unwrap();
//! let frames = ramp.energies().map(|e| {
//!     let pixels = vec![0u16; 512 * 512]; // acquired image at energy `e`
//!     Frame::new(e, Image::from_u16(512, 512, pixels).unwrap(), 1.0)
//! });
//!
//! let table = controller.run(frames).unwrap();
//! table.save_ivdat("run.ivdat").unwrap();
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Rescale**: stretch the basis about the (0,0) spot by `√(E_prev / E)`
//! 2. **Enumerate**: every substrate and domain reflex inside the Ewald radius and
//!    on the visible screen, with a radial correction for the curved screen
//! 3. **Refine**: kernel-weighted local maximum, then an intensity centroid
//! 4. **Integrate**: elliptical signal region, annular background, S/N gate; spots
//!    that fail are retried from their prediction with a tighter search
//! 5. **Recalibrate**: fit origin and basis to bright spot triples, compare with the
//!    current model and blend the candidate in, or reject it and repeat the frame
//!

pub mod calibration;
pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod integrate;
pub mod lattice;
pub mod output;
pub mod refine;
pub mod spot;

pub use calibration::{
    AcceptancePolicy, BasisEstimator, BeamCurrentMode, CalibrationController, FrameReport,
    RecalibrationConfig, RecalibrationOutcome, SearchConfig, TripleFit, TripleFitConfig,
};
pub use config::{EnergyRamp, IndexLists, RunConfig};
pub use error::{MkivError, Result};
pub use frame::{Frame, Image, PixelData, ScreenConfig, ScreenRegion};
pub use geometry::{GeometryConfig, GeometryModel, ManualSpot};
pub use integrate::{ApertureConfig, EllipseAperture, IntegrationSummary, IntensityIntegrator};
pub use lattice::{DomainTransform, LatticeConfig, SpotEnumerator};
pub use output::{IvRow, IvTable};
pub use refine::{PeakRefiner, RefineKernel, RefineParams};
pub use spot::{LatticeIndex, Spot, SpotState, INTENSITY_SENTINEL};

// Screen coordinates in pixels. The triple fit subtracts nearly equal
// positions, so these stay 64-bit.
pub type Vector2 = nalgebra::Vector2<f64>;
pub type Matrix2 = nalgebra::Matrix2<f64>;
