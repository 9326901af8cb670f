//! Lattice recalibration and the per-frame tracking loop.
//!
//! - [`fit`]: origin and basis from spot triples
//! - [`policy`]: accept, reject or force-accept a fitted candidate
//! - [`beam`]: beam current normalisation
//! - [`controller`]: the energy loop tying every stage together

pub mod beam;
pub mod combinations;
pub mod controller;
pub mod fit;
pub mod policy;

pub use beam::{BeamCurrentMode, BeamCurrentTracker};
pub use controller::{
    mark_membership, select_recalibration_spots, CalibrationController, CalibrationState,
    FrameReport, RecalibrationConfig, RecalibrationOutcome, SearchConfig,
};
pub use fit::{
    fit_lattice, BasisEstimator, FitPoint, LatticeEstimate, RadialCorrection, TripleFit,
    TripleFitConfig, TripleFitResult,
};
pub use policy::{AcceptancePolicy, Verdict};
