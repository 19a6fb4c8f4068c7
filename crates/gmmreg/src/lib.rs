#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

mod classify;
mod error;
mod estep;
mod model;
mod mstep;

pub mod se3;
pub mod tree;

pub use classify::classify;
pub use error::GmmTreeError;
pub use estep::{expectation_step, Moments};
pub use model::{
    fit, predict, register_point_clouds, GmmTree, GmmTreeParams, MixtureParameters,
    ProgressCallback, RegistrationCriteria, RegistrationResult, Termination,
};
pub use mstep::maximization_step;
pub use tree::{build_gmm_tree, cumulative_node_count, GmmNode, TREE_BRANCHING};

// the rigid transform type appears throughout the public API
pub use gmmreg_3d::transforms::RigidTransform;
