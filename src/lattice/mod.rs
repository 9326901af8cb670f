//! Reciprocal lattice: superstructure domains and per-frame spot enumeration.

pub mod domain;
pub mod enumerate;

pub use domain::DomainTransform;
pub use enumerate::{ewald_radius, spot_capacity, LatticeConfig, SpotEnumerator, H2M};
