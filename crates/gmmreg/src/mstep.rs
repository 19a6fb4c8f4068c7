//! Maximization step: solve a stacked weighted least-squares system for the
//! incremental twist.

use faer::prelude::SpSolverLstsq;

use gmmreg_3d::linalg::cross3;
use gmmreg_3d::transforms::RigidTransform;

use crate::error::GmmTreeError;
use crate::estep::Moments;
use crate::se3::twist_mul;
use crate::tree::{sym_eigen33, GmmNode};

// nodes below this responsibility mass contribute no residual rows
const MASS_EPSILON: f64 = f32::EPSILON as f64;

/// Solve for the incremental rigid motion from the accumulated moments and
/// compose it with the prior transform.
///
/// Each contributing node yields three residual rows, whitened by the
/// eigendecomposition of the node covariance and weighted by the node's
/// responsibility mass. The returned scalar is the squared residual norm of
/// the least-squares solve; the registration loop compares consecutive
/// values of it.
///
/// # Errors
///
/// [`GmmTreeError::NumericalInstability`] when fewer than two nodes carry
/// responsibility mass (the stacked system is under-determined) or the solve
/// produces a non-finite twist.
pub fn maximization_step(
    moments: &[Moments],
    nodes: &[GmmNode],
    prior_transform: &RigidTransform,
) -> Result<(RigidTransform, f64), GmmTreeError> {
    let contributing = moments
        .iter()
        .enumerate()
        .filter(|(_, m)| m.m0 > MASS_EPSILON)
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    if contributing.len() < 2 {
        return Err(GmmTreeError::NumericalInstability(format!(
            "{} tree nodes received responsibility mass, at least 2 are needed",
            contributing.len()
        )));
    }

    let mut mat_a = faer::Mat::<f64>::zeros(3 * contributing.len(), 6);
    let mut mat_b = faer::Mat::<f64>::zeros(3 * contributing.len(), 1);

    for (row_block, &i) in contributing.iter().enumerate() {
        let moment = &moments[i];
        let node = &nodes[i];

        // responsibility-weighted mean of the target points under this node
        let s = [
            moment.m1[0] / moment.m0,
            moment.m1[1] / moment.m0,
            moment.m1[2] / moment.m0,
        ];

        // whitening rows: eigenvectors scaled by sqrt(m0 / lambda)
        let (evals, evecs) = sym_eigen33(&node.covariance);
        for k in 0..3 {
            let lambda = evals[k].max(f64::EPSILON);
            let scale = (moment.m0 / lambda).sqrt();
            let w = [
                evecs[0][k] * scale,
                evecs[1][k] * scale,
                evecs[2][k] * scale,
            ];

            let row = 3 * row_block + k;
            let diff = [
                node.mean[0] - s[0],
                node.mean[1] - s[1],
                node.mean[2] - s[2],
            ];
            mat_b.write(row, 0, w[0] * diff[0] + w[1] * diff[1] + w[2] * diff[2]);

            let rotational = cross3(&s, &w);
            for col in 0..3 {
                mat_a.write(row, col, rotational[col]);
                mat_a.write(row, col + 3, w[col]);
            }
        }
    }

    let params = mat_a.qr().solve_lstsq(mat_b.clone());
    let x = params.col(0);

    let twist = [x[0], x[1], x[2], x[3], x[4], x[5]];
    if twist.iter().any(|v| !v.is_finite()) {
        return Err(GmmTreeError::NumericalInstability(
            "least-squares solve produced a non-finite twist".into(),
        ));
    }

    let residual = &mat_a * &params - &mat_b;
    let objective = residual.squared_norm_l2();

    let (rotation, translation) = twist_mul(
        &twist,
        &prior_transform.rotation,
        &prior_transform.translation,
    );

    Ok((RigidTransform::new(rotation, translation), objective))
}
