//! Geometry and density estimation for the crest mesh.
//!
//! Everything in this crate is pure math: world-frame vectors, the
//! forward-sector containment test used by both levels of wave
//! propagation, and the 2-D Gaussian kernel density estimator that
//! cluster heads use to summarize member positions.

mod grid;
mod kde;
mod sector;
mod vec3;

pub use grid::DensityGrid;
pub use kde::{covariance2d, Bandwidth, Kde2d, KdeError};
pub use sector::{in_sector, propagation_delay};
pub use vec3::Vec3;
