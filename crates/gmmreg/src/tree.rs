//! Hierarchical GMM tree construction.
//!
//! The tree is a flat, breadth-first arena of Gaussian components with a
//! fixed branching factor of 8. Level `L` (1-based) occupies the index range
//! `[cumulative_node_count(L - 1), cumulative_node_count(L))`; the unit-mass
//! root Gaussian over all source points is implicit and not stored. Parent
//! and child relationships follow from the index arithmetic alone, so the
//! read-only traversal in the expectation step stays cache friendly and
//! shareable across workers.

use std::ops::Range;

use glam::DVec3;
use gmmreg_3d::linalg::{array33_to_faer_mat33, det33, inverse33};

use crate::error::GmmTreeError;

/// Number of children per node.
pub const TREE_BRANCHING: usize = 8;

/// Covariance floor passed to the builder when none is specified.
pub const DEFAULT_VARIANCE_FLOOR: f64 = 1e-4;

// iteration cap for the per-node mixture refinement
const MAX_SPLIT_ITERATIONS: usize = 20;

/// One Gaussian component of the tree.
///
/// The inverse covariance and density normalization constant are cached at
/// construction; the tree is immutable once built.
#[derive(Debug, Clone)]
pub struct GmmNode {
    /// Mixture weight of this component. The weights of the 8 children of
    /// any node sum to the parent's prior.
    pub prior: f64,
    /// Mean of the component.
    pub mean: [f64; 3],
    /// Covariance of the component.
    pub covariance: [[f64; 3]; 3],
    inv_covariance: [[f64; 3]; 3],
    norm_factor: f64,
}

impl GmmNode {
    /// Create a node from a prior, mean and covariance, caching the density
    /// terms.
    pub fn new(prior: f64, mean: [f64; 3], covariance: [[f64; 3]; 3]) -> Self {
        let det = det33(&covariance);
        let (inv_covariance, norm_factor) = match inverse33(&covariance) {
            Some(inv) if det > 0.0 => {
                let two_pi_cubed = (2.0 * std::f64::consts::PI).powi(3);
                (inv, 1.0 / (two_pi_cubed * det).sqrt())
            }
            _ => ([[0.0; 3]; 3], 0.0),
        };
        Self {
            prior,
            mean,
            covariance,
            inv_covariance,
            norm_factor,
        }
    }

    /// Evaluate `prior * N(point; mean, covariance)`.
    ///
    /// Returns zero for components with a singular covariance or zero prior.
    pub fn weighted_density(&self, point: &[f64; 3]) -> f64 {
        if self.norm_factor == 0.0 || self.prior == 0.0 {
            return 0.0;
        }
        let d = [
            point[0] - self.mean[0],
            point[1] - self.mean[1],
            point[2] - self.mean[2],
        ];
        let inv = &self.inv_covariance;
        let mut quad = 0.0;
        for i in 0..3 {
            quad += d[i] * (inv[i][0] * d[0] + inv[i][1] * d[1] + inv[i][2] * d[2]);
        }
        self.prior * self.norm_factor * (-0.5 * quad).exp()
    }
}

/// Total number of nodes in a complete tree of the given depth.
///
/// `cumulative_node_count(L) = 8 * (1 - 8^L) / (1 - 8)`; zero for `L = 0`.
pub fn cumulative_node_count(level: usize) -> usize {
    (TREE_BRANCHING.pow(level as u32 + 1) - TREE_BRANCHING) / (TREE_BRANCHING - 1)
}

/// Index range of the nodes belonging to one (1-based) tree level.
pub fn level_range(level: usize) -> Range<usize> {
    cumulative_node_count(level - 1)..cumulative_node_count(level)
}

/// Index range of the 8 children of the node at the given global index.
///
/// `level` is the (1-based) level the node lives on.
pub fn children_range(level: usize, node_index: usize) -> Range<usize> {
    let position = node_index - cumulative_node_count(level - 1);
    let start = cumulative_node_count(level) + TREE_BRANCHING * position;
    start..start + TREE_BRANCHING
}

/// Build a complete GMM tree over the source points.
///
/// # Arguments
///
/// * `points` - Source point set.
/// * `tree_level` - Depth of the tree; must be at least 1.
/// * `lambda_s` - Tolerance on the mean log-likelihood improvement of each
///   local mixture refinement.
/// * `variance_floor` - Added to covariance diagonals to keep them positive
///   definite.
///
/// # Returns
///
/// The flat breadth-first node arena.
///
/// A parent whose point subset is empty still produces 8 children with zero
/// priors, keeping the fixed branching factor; a non-empty subset with fewer
/// than 8 points fails with [`GmmTreeError::DegenerateInput`].
pub fn build_gmm_tree(
    points: &[[f64; 3]],
    tree_level: usize,
    lambda_s: f64,
    variance_floor: f64,
) -> Result<Vec<GmmNode>, GmmTreeError> {
    if tree_level < 1 {
        return Err(GmmTreeError::DegenerateInput(
            "tree level must be at least 1".into(),
        ));
    }
    if points.len() < TREE_BRANCHING {
        return Err(GmmTreeError::DegenerateInput(format!(
            "{} source points cannot seed an 8-way split",
            points.len()
        )));
    }

    let root_subset = (0..points.len()).collect::<Vec<_>>();
    let (root_mean, root_cov) = sample_mean_cov(points, &root_subset, variance_floor);

    let mut nodes = Vec::with_capacity(cumulative_node_count(tree_level));
    let mut parents = vec![(1.0, root_mean, root_cov, root_subset)];

    for _ in 1..=tree_level {
        let mut next_parents = Vec::with_capacity(parents.len() * TREE_BRANCHING);
        for (prior, mean, cov, subset) in &parents {
            let (children, subsets) =
                split_node(points, subset, *prior, mean, cov, lambda_s, variance_floor)?;
            for (child, child_subset) in children.into_iter().zip(subsets) {
                next_parents.push((child.prior, child.mean, child.covariance, child_subset));
                nodes.push(child);
            }
        }
        parents = next_parents;
    }

    Ok(nodes)
}

/// Split one parent into 8 children by a local weighted mixture refinement
/// over the points assigned to the parent.
fn split_node(
    points: &[[f64; 3]],
    subset: &[usize],
    parent_prior: f64,
    parent_mean: &[f64; 3],
    parent_cov: &[[f64; 3]; 3],
    lambda_s: f64,
    variance_floor: f64,
) -> Result<(Vec<GmmNode>, Vec<Vec<usize>>), GmmTreeError> {
    if subset.is_empty() {
        // zero-mass branch: keep the structure, carry no mass
        let degenerate = GmmNode::new(0.0, *parent_mean, floor_eye(variance_floor));
        return Ok((
            vec![degenerate; TREE_BRANCHING],
            vec![Vec::new(); TREE_BRANCHING],
        ));
    }
    if subset.len() < TREE_BRANCHING {
        return Err(GmmTreeError::DegenerateInput(format!(
            "cannot split a node holding {} points into {} children",
            subset.len(),
            TREE_BRANCHING
        )));
    }

    // seed the 8 components at the parent mean displaced along every sign
    // combination of the scaled principal axes
    let (evals, evecs) = sym_eigen33(parent_cov);
    let mut components = (0..TREE_BRANCHING)
        .map(|c| {
            let mut mean = *parent_mean;
            for k in 0..3 {
                let sign = if (c >> k) & 1 == 1 { 1.0 } else { -1.0 };
                let scale = evals[k].max(variance_floor).sqrt();
                for (m, e) in mean.iter_mut().zip(evecs.iter()) {
                    *m += sign * scale * e[k];
                }
            }
            GmmNode::new(1.0 / TREE_BRANCHING as f64, mean, *parent_cov)
        })
        .collect::<Vec<_>>();

    let n = subset.len();
    let mut resp = vec![[0.0f64; TREE_BRANCHING]; n];
    let mut prev_ll = f64::NEG_INFINITY;

    for _ in 0..MAX_SPLIT_ITERATIONS {
        // expectation over the subset
        let mut ll = 0.0;
        for (ri, &pi) in resp.iter_mut().zip(subset.iter()) {
            let point = &points[pi];
            let mut total = 0.0;
            for (rc, comp) in ri.iter_mut().zip(components.iter()) {
                *rc = comp.weighted_density(point);
                total += *rc;
            }
            if total > 0.0 {
                for rc in ri.iter_mut() {
                    *rc /= total;
                }
                ll += total.ln();
            } else {
                // every component underflows; spread the point uniformly
                *ri = [1.0 / TREE_BRANCHING as f64; TREE_BRANCHING];
                ll += f64::MIN_POSITIVE.ln();
            }
        }
        let ll = ll / n as f64;

        // maximization over weights, means and floored covariances
        for c in 0..TREE_BRANCHING {
            let mass = resp.iter().map(|r| r[c]).sum::<f64>();
            if mass <= f64::EPSILON {
                components[c] = GmmNode::new(0.0, components[c].mean, floor_eye(variance_floor));
                continue;
            }

            let mut mean = DVec3::ZERO;
            for (r, &pi) in resp.iter().zip(subset.iter()) {
                mean += r[c] * DVec3::from_array(points[pi]);
            }
            mean /= mass;

            let mut scatter = [[0.0; 3]; 3];
            for (r, &pi) in resp.iter().zip(subset.iter()) {
                let d = DVec3::from_array(points[pi]) - mean;
                let d = d.to_array();
                for i in 0..3 {
                    for j in 0..3 {
                        scatter[i][j] += r[c] * d[i] * d[j];
                    }
                }
            }
            let mut cov = [[0.0; 3]; 3];
            for i in 0..3 {
                for j in 0..3 {
                    cov[i][j] = scatter[i][j] / mass;
                }
                cov[i][i] += variance_floor;
            }

            components[c] = GmmNode::new(mass / n as f64, mean.to_array(), cov);
        }

        if (ll - prev_ll).abs() < lambda_s {
            break;
        }
        prev_ll = ll;
    }

    // hard-assign each point to its strongest component for the next level
    let mut subsets = vec![Vec::new(); TREE_BRANCHING];
    for (r, &pi) in resp.iter().zip(subset.iter()) {
        let mut best = 0;
        for c in 1..TREE_BRANCHING {
            if r[c] > r[best] {
                best = c;
            }
        }
        subsets[best].push(pi);
    }

    let children = components
        .into_iter()
        .map(|c| GmmNode::new(parent_prior * c.prior, c.mean, c.covariance))
        .collect();

    Ok((children, subsets))
}

/// Sample mean and floored covariance of a point subset.
fn sample_mean_cov(
    points: &[[f64; 3]],
    subset: &[usize],
    variance_floor: f64,
) -> ([f64; 3], [[f64; 3]; 3]) {
    let n = subset.len() as f64;
    let mut mean = DVec3::ZERO;
    for &pi in subset {
        mean += DVec3::from_array(points[pi]);
    }
    mean /= n;

    let mut cov = [[0.0; 3]; 3];
    for &pi in subset {
        let d = (DVec3::from_array(points[pi]) - mean).to_array();
        for i in 0..3 {
            for j in 0..3 {
                cov[i][j] += d[i] * d[j] / n;
            }
        }
    }
    for (i, row) in cov.iter_mut().enumerate() {
        row[i] += variance_floor;
    }

    (mean.to_array(), cov)
}

fn floor_eye(variance_floor: f64) -> [[f64; 3]; 3] {
    [
        [variance_floor, 0.0, 0.0],
        [0.0, variance_floor, 0.0],
        [0.0, 0.0, variance_floor],
    ]
}

/// Eigendecomposition of a symmetric 3x3 matrix.
///
/// Returns the eigenvalues in ascending order and the matching eigenvectors
/// as the columns of the second array.
pub(crate) fn sym_eigen33(mat: &[[f64; 3]; 3]) -> ([f64; 3], [[f64; 3]; 3]) {
    let evd = array33_to_faer_mat33(mat).selfadjoint_eigendecomposition(faer::Side::Lower);
    let s = evd.s().column_vector();
    let u = evd.u();

    let mut evals = [0.0; 3];
    let mut evecs = [[0.0; 3]; 3];
    for k in 0..3 {
        evals[k] = s.read(k);
        for d in 0..3 {
            evecs[d][k] = u.read(d, k);
        }
    }
    (evals, evecs)
}
