#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Linear algebra utilities.
pub mod linalg;

/// Point cloud container and boundary traits.
pub mod pointcloud;

/// Rigid transform algebra.
pub mod transforms;
