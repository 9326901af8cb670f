//! Error type for the fatal failure modes of a tracking run.
//!
//! Everything that only affects a single frame (a degenerate triple, too few
//! spots to recalibrate, an exhausted repeat budget) is reported through
//! [`RecalibrationOutcome`](crate::calibration::RecalibrationOutcome) instead and
//! never surfaces here.

use thiserror::Error;

/// Fatal errors raised by the tracking core.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MkivError {
    /// Beam energy was zero, negative or not finite.
    #[error("invalid beam energy {energy} eV: must be positive and finite")]
    InvalidEnergy { energy: f64 },

    /// More spots are visible than the run was sized for.
    #[error("spot list overflow: {count} spots enumerated, capacity is {capacity}")]
    TooManySpots { count: usize, capacity: usize },

    /// Fewer than three operator-identified spots were supplied.
    #[error("at least 3 reference spots are needed to build a lattice, got {count}")]
    TooFewReferenceSpots { count: usize },

    /// No spot triple passed the separation and determinant filters.
    #[error("no valid spot triple among {spots} reference spots")]
    NoValidTriples { spots: usize },

    /// Basis vectors are (nearly) collinear or zero length.
    #[error("basis vectors are degenerate (|sin angle| = {sin_angle:.3e})")]
    DegenerateBasis { sin_angle: f64 },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pixel buffer length does not match the declared dimensions.
    #[error("pixel buffer holds {len} samples but image is {width}x{height}")]
    ImageSizeMismatch { len: usize, width: u32, height: u32 },

    /// Screen mask and frame have different dimensions.
    #[error("screen mask is {mask_width}x{mask_height} but frame is {width}x{height}")]
    MaskSizeMismatch {
        mask_width: u32,
        mask_height: u32,
        width: u32,
        height: u32,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MkivError>;
