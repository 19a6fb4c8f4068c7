//! Expectation step: pruned tree traversal accumulating soft moments.

use rayon::prelude::*;

use gmmreg_3d::linalg::outer3;

use crate::tree::{children_range, level_range, GmmNode, TREE_BRANCHING};

// chunk size of the parallel path; fixed so the merge order (and thus the
// floating point result) does not depend on the worker count
const CHUNK_SIZE: usize = 1024;

/// Accumulated soft-responsibility statistics for one tree node.
#[derive(Debug, Clone, Copy)]
pub struct Moments {
    /// Total responsibility mass.
    pub m0: f64,
    /// Responsibility-weighted sum of target points.
    pub m1: [f64; 3],
    /// Responsibility-weighted scatter of target points.
    pub m2: [[f64; 3]; 3],
}

impl Moments {
    /// The zero-valued moments.
    pub const ZERO: Self = Self {
        m0: 0.0,
        m1: [0.0; 3],
        m2: [[0.0; 3]; 3],
    };

    fn accumulate(&mut self, responsibility: f64, point: &[f64; 3]) {
        self.m0 += responsibility;
        for k in 0..3 {
            self.m1[k] += responsibility * point[k];
        }
        let outer = outer3(point, point);
        for i in 0..3 {
            for j in 0..3 {
                self.m2[i][j] += responsibility * outer[i][j];
            }
        }
    }

    fn merge(&mut self, other: &Self) {
        self.m0 += other.m0;
        for k in 0..3 {
            self.m1[k] += other.m1[k];
        }
        for i in 0..3 {
            for j in 0..3 {
                self.m2[i][j] += other.m2[i][j];
            }
        }
    }
}

/// Compute per-node moments for a target point set against a built tree.
///
/// # Arguments
///
/// * `target` - Target point set.
/// * `nodes` - Flat node arena from the builder.
/// * `tree_level` - Depth of the tree.
/// * `lambda_c` - Pruning threshold on the relative responsibility of a
///   branch; branches below it are not descended into.
/// * `parallel` - Process target points on the rayon pool. Chunks have a
///   fixed size and the per-chunk results are merged in chunk order, so the
///   outcome does not depend on the worker count.
///
/// # Returns
///
/// One [`Moments`] per tree node; zero-valued for nodes that were pruned or
/// never visited.
pub fn expectation_step(
    target: &[[f64; 3]],
    nodes: &[GmmNode],
    tree_level: usize,
    lambda_c: f64,
    parallel: bool,
) -> Vec<Moments> {
    if parallel {
        let partials = target
            .par_chunks(CHUNK_SIZE)
            .map(|chunk| {
                let mut moments = vec![Moments::ZERO; nodes.len()];
                for point in chunk {
                    accumulate_point(point, nodes, tree_level, lambda_c, &mut moments);
                }
                moments
            })
            .collect::<Vec<_>>();

        let mut moments = vec![Moments::ZERO; nodes.len()];
        for partial in &partials {
            for (acc, m) in moments.iter_mut().zip(partial.iter()) {
                acc.merge(m);
            }
        }
        moments
    } else {
        let mut moments = vec![Moments::ZERO; nodes.len()];
        for point in target {
            accumulate_point(point, nodes, tree_level, lambda_c, &mut moments);
        }
        moments
    }
}

/// Traverse the tree for one point, accumulating into the deepest surviving
/// nodes.
///
/// Responsibilities at each level are normalized by the sum over all
/// evaluated candidates of that level, so pruning only ever removes mass.
fn accumulate_point(
    point: &[f64; 3],
    nodes: &[GmmNode],
    tree_level: usize,
    lambda_c: f64,
    moments: &mut [Moments],
) {
    let mut frontier = level_range(1).collect::<Vec<_>>();
    let mut candidates = Vec::with_capacity(frontier.len() * TREE_BRANCHING);

    for level in 1..=tree_level {
        candidates.clear();
        if level == 1 {
            candidates.extend(frontier.iter().copied());
        } else {
            for &idx in &frontier {
                candidates.extend(children_range(level - 1, idx));
            }
        }

        let mut total = 0.0;
        let densities = candidates
            .iter()
            .map(|&idx| {
                let d = nodes[idx].weighted_density(point);
                total += d;
                d
            })
            .collect::<Vec<_>>();

        if total <= 0.0 {
            // the point is unexplained by every candidate branch
            return;
        }

        if level == tree_level {
            for (&idx, &density) in candidates.iter().zip(densities.iter()) {
                let responsibility = density / total;
                if responsibility >= lambda_c {
                    moments[idx].accumulate(responsibility, point);
                }
            }
        } else {
            frontier.clear();
            for (&idx, &density) in candidates.iter().zip(densities.iter()) {
                if density / total >= lambda_c {
                    frontier.push(idx);
                }
            }
            if frontier.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{build_gmm_tree, level_range, DEFAULT_VARIANCE_FLOOR};
    use approx::assert_relative_eq;

    fn corner_blobs() -> Vec<[f64; 3]> {
        let mut points = Vec::new();
        for corner in 0..8 {
            let cx = if corner & 1 == 1 { 1.0 } else { -1.0 };
            let cy = if corner & 2 == 2 { 1.0 } else { -1.0 };
            let cz = if corner & 4 == 4 { 1.0 } else { -1.0 };
            for i in 0..3 {
                for j in 0..3 {
                    for k in 0..3 {
                        points.push([
                            cx + i as f64 * 0.05,
                            cy + j as f64 * 0.05,
                            cz + k as f64 * 0.05,
                        ]);
                    }
                }
            }
        }
        points
    }

    #[test]
    fn test_moment_bounds() -> Result<(), crate::GmmTreeError> {
        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;
        let moments = expectation_step(&points, &nodes, 2, 0.01, false);

        assert_eq!(moments.len(), nodes.len());
        let num_points = points.len() as f64;
        for m in &moments {
            assert!(m.m0 >= 0.0);
            assert!(m.m0 <= num_points);
        }

        // mass distributed at the deepest level never exceeds the point count
        let level_mass = moments[level_range(2)].iter().map(|m| m.m0).sum::<f64>();
        assert!(level_mass <= num_points + 1e-9);
        assert!(level_mass > 0.0);
        Ok(())
    }

    #[test]
    fn test_no_pruning_distributes_all_mass() -> Result<(), crate::GmmTreeError> {
        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;
        let moments = expectation_step(&points, &nodes, 2, 0.0, false);

        let level_mass = moments[level_range(2)].iter().map(|m| m.m0).sum::<f64>();
        assert_relative_eq!(level_mass, points.len() as f64, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_pruning_monotonicity() -> Result<(), crate::GmmTreeError> {
        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;

        let visited = |lambda_c: f64| {
            expectation_step(&points, &nodes, 2, lambda_c, false)
                .iter()
                .filter(|m| m.m0 > 0.0)
                .count()
        };

        let loose = visited(0.0);
        let medium = visited(0.01);
        let tight = visited(0.2);
        assert!(loose >= medium);
        assert!(medium >= tight);
        Ok(())
    }

    #[test]
    fn test_parallel_matches_serial() -> Result<(), crate::GmmTreeError> {
        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;

        let serial = expectation_step(&points, &nodes, 2, 0.01, false);
        let parallel = expectation_step(&points, &nodes, 2, 0.01, true);

        for (s, p) in serial.iter().zip(parallel.iter()) {
            assert_eq!(s.m0, p.m0);
            assert_eq!(s.m1, p.m1);
            assert_eq!(s.m2, p.m2);
        }
        Ok(())
    }

    #[test]
    fn test_random_target_mass_bounds() -> Result<(), crate::GmmTreeError> {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;

        let mut rng = StdRng::seed_from_u64(42);
        let target = (0..500)
            .map(|_| {
                [
                    rng.random_range(-1.5..1.5),
                    rng.random_range(-1.5..1.5),
                    rng.random_range(-1.5..1.5),
                ]
            })
            .collect::<Vec<[f64; 3]>>();

        let moments = expectation_step(&target, &nodes, 2, 0.01, false);
        let num_points = target.len() as f64;
        for m in &moments {
            assert!(m.m0 >= 0.0 && m.m0 <= num_points);
        }
        let level_mass = moments[level_range(2)].iter().map(|m| m.m0).sum::<f64>();
        assert!(level_mass <= num_points + 1e-9);
        Ok(())
    }

    #[test]
    fn test_far_point_contributes_nothing() -> Result<(), crate::GmmTreeError> {
        let points = corner_blobs();
        let nodes = build_gmm_tree(&points, 2, 1e-3, DEFAULT_VARIANCE_FLOOR)?;

        let far = [[1e6, 1e6, 1e6]];
        let moments = expectation_step(&far, &nodes, 2, 0.01, false);
        assert!(moments.iter().all(|m| m.m0 == 0.0));
        Ok(())
    }
}
