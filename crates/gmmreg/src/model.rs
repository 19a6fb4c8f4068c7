//! GMM tree model and the EM registration loop.

use gmmreg_3d::pointcloud::AsPoints;
use gmmreg_3d::transforms::RigidTransform;

use crate::classify::classify;
use crate::error::GmmTreeError;
use crate::estep::{expectation_step, Moments};
use crate::mstep::maximization_step;
use crate::tree::{build_gmm_tree, cumulative_node_count, GmmNode, DEFAULT_VARIANCE_FLOOR};

/// Progress callback invoked once per completed registration iteration with
/// the current estimate of the transform mapping source points into the
/// target frame.
pub type ProgressCallback<'a> = &'a dyn Fn(&RigidTransform);

/// Parameters controlling tree construction and the E-step.
#[derive(Debug, Clone, Copy)]
pub struct GmmTreeParams {
    /// Maximum depth level of the tree.
    pub tree_level: usize,
    /// Pruning threshold of the E-step traversal.
    pub lambda_c: f64,
    /// Split tolerance of the tree builder.
    pub lambda_s: f64,
    /// Covariance floor applied during construction.
    pub variance_floor: f64,
    /// Initial value of the registration transform.
    pub init_transform: RigidTransform,
    /// Run the E-step over target points on the rayon pool.
    pub parallel: bool,
}

impl Default for GmmTreeParams {
    fn default() -> Self {
        Self {
            tree_level: 2,
            lambda_c: 0.01,
            lambda_s: 0.001,
            variance_floor: DEFAULT_VARIANCE_FLOOR,
            init_transform: RigidTransform::IDENTITY,
            parallel: false,
        }
    }
}

/// Convergence criteria of the registration loop.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationCriteria {
    /// Maximum number of EM iterations to perform.
    pub max_iterations: usize,
    /// Convergence tolerance as the difference in the objective between two
    /// consecutive iterations.
    pub tolerance: f64,
}

impl Default for RegistrationCriteria {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-4,
        }
    }
}

/// How the registration loop terminated.
///
/// Exhausting the iteration budget is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The objective change dropped below the tolerance.
    Converged,
    /// The iteration budget was exhausted before convergence.
    MaxIterationsReached,
}

/// Result of the registration loop.
///
/// The transform maps source points into the target frame.
#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Estimated source-to-target transform.
    pub transform: RigidTransform,
    /// Last value of the convergence objective.
    pub objective: f64,
    /// Number of completed iterations.
    pub num_iterations: usize,
    /// Terminal state of the loop.
    pub termination: Termination,
}

/// Flattened per-node mixture parameters of a built tree.
#[derive(Debug, Clone)]
pub struct MixtureParameters {
    /// Prior weight of every node.
    pub priors: Vec<f64>,
    /// Mean of every node.
    pub centers: Vec<[f64; 3]>,
    /// Covariance of every node.
    pub covariances: Vec<[[f64; 3]; 3]>,
}

/// A hierarchical Gaussian mixture model of a source point cloud.
///
/// The tree is built eagerly at construction and is immutable afterwards;
/// replacing the source rebuilds it wholesale.
#[derive(Debug, Clone)]
pub struct GmmTree {
    nodes: Vec<GmmNode>,
    params: GmmTreeParams,
}

impl GmmTree {
    /// Build a model over the source points.
    pub fn new<P: AsPoints + ?Sized>(
        source: &P,
        params: GmmTreeParams,
    ) -> Result<Self, GmmTreeError> {
        let nodes = build_gmm_tree(
            source.as_points(),
            params.tree_level,
            params.lambda_s,
            params.variance_floor,
        )?;
        Ok(Self { nodes, params })
    }

    /// Replace the source point cloud, rebuilding the tree.
    pub fn set_source<P: AsPoints + ?Sized>(&mut self, source: &P) -> Result<(), GmmTreeError> {
        self.nodes = build_gmm_tree(
            source.as_points(),
            self.params.tree_level,
            self.params.lambda_s,
            self.params.variance_floor,
        )?;
        Ok(())
    }

    /// The flat breadth-first node arena.
    pub fn nodes(&self) -> &[GmmNode] {
        &self.nodes
    }

    /// Depth of the tree.
    pub fn tree_level(&self) -> usize {
        self.params.tree_level
    }

    /// Number of nodes introduced at each level, shallowest first.
    pub fn nodes_per_level(&self) -> Vec<usize> {
        (1..=self.params.tree_level)
            .map(|level| cumulative_node_count(level) - cumulative_node_count(level - 1))
            .collect()
    }

    /// Run the expectation step for a target point set against this model.
    pub fn expectation_step(&self, target: &[[f64; 3]]) -> Vec<Moments> {
        expectation_step(
            target,
            &self.nodes,
            self.params.tree_level,
            self.params.lambda_c,
            self.params.parallel,
        )
    }

    /// Run the maximization step for previously computed moments.
    pub fn maximization_step(
        &self,
        moments: &[Moments],
        prior_transform: &RigidTransform,
    ) -> Result<(RigidTransform, f64), GmmTreeError> {
        maximization_step(moments, &self.nodes, prior_transform)
    }

    // one EM cycle at a fixed working transform: move the target into the
    // source frame, accumulate moments, solve for the composed update
    fn em_cycle(
        &self,
        target: &[[f64; 3]],
        transform: &RigidTransform,
    ) -> Result<(RigidTransform, f64), GmmTreeError> {
        let mut moved = vec![[0.0; 3]; target.len()];
        transform.transform_points(target, &mut moved);
        let moments = self.expectation_step(&moved);
        self.maximization_step(&moments, transform)
    }

    /// Register a target point set against this model.
    ///
    /// The working transform maps the target into the source frame; the
    /// callbacks and the returned result receive its inverse, the estimate
    /// mapping source points into the target frame.
    ///
    /// An extra E/M evaluation at the starting transform seeds the
    /// convergence criterion, so a start at a local optimum converges within
    /// a single iteration.
    pub fn registration<P: AsPoints + ?Sized>(
        &self,
        target: &P,
        criteria: RegistrationCriteria,
        callbacks: &[ProgressCallback],
    ) -> Result<RegistrationResult, GmmTreeError> {
        let target = target.as_points();

        let mut transform = self.params.init_transform;
        let (mut pending, mut prev_objective) = self.em_cycle(target, &transform)?;

        let mut result = RegistrationResult {
            transform: transform.inverse(),
            objective: prev_objective,
            num_iterations: 0,
            termination: Termination::MaxIterationsReached,
        };

        for iteration in 0..criteria.max_iterations {
            transform = pending;
            for callback in callbacks {
                callback(&transform.inverse());
            }

            let (next, objective) = self.em_cycle(target, &transform)?;
            log::debug!("Iteration: {}, Criteria: {}", iteration, objective);

            result.num_iterations = iteration + 1;
            result.objective = objective;

            if (objective - prev_objective).abs() < criteria.tolerance {
                result.termination = Termination::Converged;
                break;
            }
            prev_objective = objective;
            pending = next;
        }

        result.transform = transform.inverse();
        Ok(result)
    }
}

/// Fit a GMM tree model and return its flattened mixture parameters along
/// with the number of nodes introduced at each level.
pub fn fit<P: AsPoints + ?Sized>(
    source: &P,
    params: GmmTreeParams,
) -> Result<(GmmTree, MixtureParameters, Vec<usize>), GmmTreeError> {
    let model = GmmTree::new(source, params)?;

    let parameters = MixtureParameters {
        priors: model.nodes.iter().map(|n| n.prior).collect(),
        centers: model.nodes.iter().map(|n| n.mean).collect(),
        covariances: model.nodes.iter().map(|n| n.covariance).collect(),
    };
    let nodes_per_level = model.nodes_per_level();

    Ok((model, parameters, nodes_per_level))
}

/// Assign each query point to the nearest node center at one tree level of
/// a fitted model.
pub fn predict<P: AsPoints + ?Sized>(
    model: &GmmTree,
    queries: &P,
    level: usize,
    parallel: bool,
) -> Result<Vec<usize>, GmmTreeError> {
    classify(
        model.nodes(),
        model.tree_level(),
        level,
        queries.as_points(),
        parallel,
    )
}

/// One-shot rigid registration of a target point set against a source point
/// set.
///
/// Builds the GMM tree over the source and runs the EM registration loop.
pub fn register_point_clouds<S, T>(
    source: &S,
    target: &T,
    criteria: RegistrationCriteria,
    callbacks: &[ProgressCallback],
    params: GmmTreeParams,
) -> Result<RegistrationResult, GmmTreeError>
where
    S: AsPoints + ?Sized,
    T: AsPoints + ?Sized,
{
    let model = GmmTree::new(source, params)?;
    model.registration(target, criteria, callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

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
    fn test_fit_returns_flattened_parameters() -> Result<(), GmmTreeError> {
        let points = corner_blobs();
        let (model, parameters, nodes_per_level) = fit(&points, GmmTreeParams::default())?;

        assert_eq!(model.nodes().len(), 72);
        assert_eq!(parameters.priors.len(), 72);
        assert_eq!(parameters.centers.len(), 72);
        assert_eq!(parameters.covariances.len(), 72);
        assert_eq!(nodes_per_level, vec![8, 64]);
        Ok(())
    }

    #[test]
    fn test_predict_level_validation() -> Result<(), GmmTreeError> {
        let points = corner_blobs();
        let model = GmmTree::new(&points, GmmTreeParams::default())?;

        assert!(matches!(
            predict(&model, &points, 0, false),
            Err(GmmTreeError::InvalidLevel { .. })
        ));
        assert!(matches!(
            predict(&model, &points, 3, false),
            Err(GmmTreeError::InvalidLevel { .. })
        ));

        let labels = predict(&model, &points, 1, false)?;
        assert_eq!(labels.len(), points.len());
        Ok(())
    }

    #[test]
    fn test_set_source_rebuilds() -> Result<(), GmmTreeError> {
        let points = corner_blobs();
        let mut model = GmmTree::new(&points, GmmTreeParams::default())?;
        let old_mean = model.nodes()[0].mean;

        let shifted = points
            .iter()
            .map(|p| [p[0] + 10.0, p[1], p[2]])
            .collect::<Vec<_>>();
        model.set_source(&shifted)?;
        assert_ne!(model.nodes()[0].mean, old_mean);
        Ok(())
    }

    #[test]
    fn test_self_registration_is_identity() -> Result<(), GmmTreeError> {
        let _ = env_logger::builder().is_test(true).try_init();

        let points = corner_blobs();
        let model = GmmTree::new(&points, GmmTreeParams::default())?;

        let result = model.registration(
            &points,
            RegistrationCriteria {
                max_iterations: 50,
                tolerance: 1e-4,
            },
            &[],
        )?;

        assert_eq!(result.termination, Termination::Converged);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (result.transform.rotation[i][j] - expected).abs() < 0.05,
                    "rotation {:?}",
                    result.transform.rotation
                );
            }
            assert!(
                result.transform.translation[i].abs() < 0.05,
                "translation {:?}",
                result.transform.translation
            );
        }
        Ok(())
    }

    #[test]
    fn test_converges_in_one_iteration_at_optimum() -> Result<(), GmmTreeError> {
        let points = corner_blobs();
        let model = GmmTree::new(&points, GmmTreeParams::default())?;

        // source registered against itself from the identity is already at a
        // local optimum
        let result = model.registration(
            &points,
            RegistrationCriteria {
                max_iterations: 1,
                tolerance: 1e-3,
            },
            &[],
        )?;

        assert_eq!(result.termination, Termination::Converged);
        assert_eq!(result.num_iterations, 1);
        Ok(())
    }

    #[test]
    fn test_recovers_small_rigid_motion() -> Result<(), GmmTreeError> {
        let points = corner_blobs();

        let expected = RigidTransform::from_axis_angle(&[0.0, 0.0, 1.0], 0.1, [0.05, -0.03, 0.02])
            .expect("valid axis");
        let mut target = vec![[0.0; 3]; points.len()];
        expected.transform_points(&points, &mut target);

        let result = register_point_clouds(
            &points,
            &target,
            RegistrationCriteria {
                max_iterations: 50,
                tolerance: 1e-6,
            },
            &[],
            GmmTreeParams::default(),
        )?;

        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    (result.transform.rotation[i][j] - expected.rotation[i][j]).abs() < 0.03,
                    "rotation {:?}",
                    result.transform.rotation
                );
            }
            assert!(
                (result.transform.translation[i] - expected.translation[i]).abs() < 0.03,
                "translation {:?}",
                result.transform.translation
            );
        }
        Ok(())
    }

    #[test]
    fn test_callbacks_observe_each_iteration() -> Result<(), GmmTreeError> {
        let points = corner_blobs();
        let model = GmmTree::new(&points, GmmTreeParams::default())?;

        let calls = Cell::new(0usize);
        let callback = |_: &RigidTransform| calls.set(calls.get() + 1);

        let result = model.registration(
            &points,
            RegistrationCriteria {
                max_iterations: 5,
                tolerance: 1e-4,
            },
            &[&callback],
        )?;

        assert_eq!(calls.get(), result.num_iterations);
        Ok(())
    }

    #[test]
    fn test_accepts_pointcloud_container() -> Result<(), GmmTreeError> {
        let cloud = gmmreg_3d::pointcloud::PointCloud::new(corner_blobs());
        let model = GmmTree::new(&cloud, GmmTreeParams::default())?;
        assert_eq!(model.nodes().len(), 72);
        Ok(())
    }
}
